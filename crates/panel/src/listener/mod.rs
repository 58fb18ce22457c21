mod credential;
mod parse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{now_millis, SystemLogger};

pub(crate) use credential::{CredentialCache, CredentialProvider, StaticCredential};
use parse::parse_frame;

type EndpointStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub(crate) struct ListenerSettings {
    pub(crate) url: String,
    /// Wait after a failed connection attempt.
    pub(crate) retry_delay: Duration,
    /// Wait after an established session ends.
    pub(crate) reconnect_delay: Duration,
    pub(crate) handshake_timeout: Duration,
}

/// Background client for the OneBot 11 event stream. Keeps reconnecting
/// until `stop` is called or the shutdown token fires.
pub(crate) struct EventListener {
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventListener {
    pub(crate) fn spawn(
        settings: ListenerSettings,
        logger: SystemLogger,
        credentials: Arc<CredentialCache>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancel = shutdown.child_token();
        let worker = tokio::spawn(run_listener(settings, logger, credentials, cancel.clone()));
        Self {
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Interrupts any pending wait, closes an open connection and waits for
    /// the worker to finish. Calling it twice is harmless.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                warn!(event = "listener.join_failed", error = %err);
            }
        }
    }
}

async fn run_listener(
    settings: ListenerSettings,
    logger: SystemLogger,
    credentials: Arc<CredentialCache>,
    cancel: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect(&settings, &credentials) => result,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    event = "listener.connect_failed",
                    url = %settings.url,
                    retry_in_ms = settings.retry_delay.as_millis() as u64,
                    error = %format!("{err:#}")
                );
                if wait_or_cancel(&cancel, settings.retry_delay).await {
                    return;
                }
                continue;
            }
        };

        info!(event = "listener.connected", url = %settings.url);
        logger
            .log("system", "napcat.connected", "NapCat OneBot11 WebSocket connected")
            .await;
        listen(stream, &logger, &cancel).await;
        info!(event = "listener.disconnected", url = %settings.url);
        logger
            .log("system", "napcat.disconnected", "NapCat OneBot11 WebSocket disconnected")
            .await;

        if wait_or_cancel(&cancel, settings.reconnect_delay).await {
            return;
        }
    }
}

/// Returns true when cancelled before `delay` elapsed.
async fn wait_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn connect(
    settings: &ListenerSettings,
    credentials: &CredentialCache,
) -> anyhow::Result<EndpointStream> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid endpoint url {}", settings.url))?;
    if let Some(token) = credentials.get().await.context("acquire endpoint credential")? {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("endpoint credential is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let handshake = tokio::time::timeout(
        settings.handshake_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await;
    match handshake {
        Err(_) => anyhow::bail!(
            "handshake timed out after {}",
            humantime::format_duration(settings.handshake_timeout)
        ),
        Ok(Err(WsError::Http(response))) if response.status() == StatusCode::UNAUTHORIZED => {
            credentials.invalidate().await;
            anyhow::bail!("endpoint rejected the credential (401)")
        }
        Ok(Err(err)) => Err(err).context("websocket handshake failed"),
        Ok(Ok((stream, _))) => Ok(stream),
    }
}

async fn listen(mut stream: EndpointStream, logger: &SystemLogger, cancel: &CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(err) = stream.close(None).await {
                    warn!(event = "listener.close_failed", error = %err);
                }
                return;
            }
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => handle_frame(text.as_bytes(), logger).await,
            Some(Ok(Message::Binary(data))) => handle_frame(&data, logger).await,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Err(err)) => {
                warn!(event = "listener.read_failed", error = %err);
                return;
            }
        }
    }
}

async fn handle_frame(raw: &[u8], logger: &SystemLogger) {
    if let Some(event) = parse_frame(raw, now_millis()) {
        logger.record(event).await;
    }
}
