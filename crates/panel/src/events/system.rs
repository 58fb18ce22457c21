use std::sync::Arc;

use protocol::{DomainEvent, NewEvent, ObserverFrame};

use super::{now_millis, EventStore};
use crate::hub::Hub;

/// Records an event and announces it to observers as a `log-entry` frame.
/// Persistence failures are logged and swallowed; nothing is published for
/// an event that was not stored.
#[derive(Clone)]
pub(crate) struct SystemLogger {
    store: Arc<dyn EventStore>,
    hub: Hub,
}

impl SystemLogger {
    pub(crate) fn new(store: Arc<dyn EventStore>, hub: Hub) -> Self {
        Self { store, hub }
    }

    pub(crate) fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub(crate) async fn log(&self, source: &str, kind: &str, summary: &str) {
        self.log_detail(source, kind, summary, "").await;
    }

    pub(crate) async fn log_detail(&self, source: &str, kind: &str, summary: &str, detail: &str) {
        let event = NewEvent::new(now_millis(), source, kind, summary).with_detail(detail);
        self.record(event).await;
    }

    pub(crate) async fn record(&self, event: NewEvent) -> Option<DomainEvent> {
        let kind = event.kind.clone();
        match self.store.add_event(event).await {
            Ok(stored) => {
                self.hub.publish_frame(&ObserverFrame::LogEntry {
                    data: stored.clone(),
                });
                Some(stored)
            }
            Err(err) => {
                tracing::warn!(event = "eventlog.persist_failed", kind = %kind, error = %err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventStore;
    use async_trait::async_trait;
    use protocol::{EventPage, EventQuery};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn add_event(&self, _event: NewEvent) -> anyhow::Result<DomainEvent> {
            anyhow::bail!("disk full")
        }
        async fn get_events(&self, _query: &EventQuery) -> anyhow::Result<EventPage> {
            anyhow::bail!("disk full")
        }
        async fn clear_events(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn persisted_event_is_published_as_log_entry() {
        let hub = Hub::spawn(CancellationToken::new());
        let mut observer = hub.subscribe().await;
        let logger = SystemLogger::new(Arc::new(MemoryEventStore::new()), hub);
        logger.log("system", "panel.start", "panel started").await;

        let raw = tokio::time::timeout(Duration::from_secs(2), observer.recv())
            .await
            .expect("timely")
            .expect("frame");
        let frame: ObserverFrame = serde_json::from_slice(&raw).expect("frame json");
        match frame {
            ObserverFrame::LogEntry { data } => {
                assert_eq!(data.id, 1);
                assert_eq!(data.kind, "panel.start");
                assert_eq!(data.summary, "panel started");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_persist_publishes_nothing() {
        let hub = Hub::spawn(CancellationToken::new());
        let mut observer = hub.subscribe().await;
        let logger = SystemLogger::new(Arc::new(FailingStore), hub.clone());
        assert!(logger.record(NewEvent::new(1, "qq", "x", "y")).await.is_none());
        hub.publish("marker");
        let raw = tokio::time::timeout(Duration::from_secs(2), observer.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert_eq!(raw, bytes::Bytes::from("marker"));
    }
}
