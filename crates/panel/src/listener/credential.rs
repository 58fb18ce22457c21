use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Source of the access token for the OneBot endpoint. `None` means the
/// endpoint is unauthenticated.
#[async_trait]
pub(crate) trait CredentialProvider: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Option<String>>;
}

/// Token configured up front (config file or `ONEBOT_TOKEN`).
pub(crate) struct StaticCredential(pub(crate) Option<String>);

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn acquire(&self) -> anyhow::Result<Option<String>> {
        Ok(self.0.clone().filter(|token| !token.is_empty()))
    }
}

/// Lazily acquired token shared by every connection attempt. Dropped on an
/// unauthorized handshake so the next attempt asks the provider again.
pub(crate) struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    cached: Mutex<Option<Option<String>>>,
}

impl CredentialCache {
    pub(crate) fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
        }
    }

    pub(crate) async fn get(&self) -> anyhow::Result<Option<String>> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.provider.acquire().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    pub(crate) async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn acquire(&self) -> anyhow::Result<Option<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(format!("token-{call}")))
        }
    }

    #[tokio::test]
    async fn token_is_cached_until_invalidated() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = CredentialCache::new(provider.clone());
        assert_eq!(cache.get().await.expect("get"), Some("token-1".to_string()));
        assert_eq!(cache.get().await.expect("get"), Some("token-1".to_string()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        cache.invalidate().await;
        assert_eq!(cache.get().await.expect("get"), Some("token-2".to_string()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_static_token_means_no_auth() {
        let cache = CredentialCache::new(Arc::new(StaticCredential(Some(String::new()))));
        assert_eq!(cache.get().await.expect("get"), None);
    }
}
