use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use protocol::ObserverFrame;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub(crate) const INGEST_CAPACITY: usize = 256;
pub(crate) const OBSERVER_CAPACITY: usize = 256;

/// Fan-out point for everything observers see. Producers call `publish`,
/// which never waits: a full ingest queue drops the message, and an observer
/// whose own queue is full is disconnected instead of slowing anyone down.
/// An observer receives exactly the messages published after its
/// `subscribe` returned, even if older ones are still queued for fan-out.
#[derive(Clone)]
pub(crate) struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    observers: Mutex<HashMap<u64, Observer>>,
    ingest_tx: mpsc::Sender<(u64, Bytes)>,
    next_id: AtomicU64,
    // Sequence number the next published message will carry.
    next_seq: AtomicU64,
    observer_capacity: usize,
}

struct Observer {
    tx: mpsc::Sender<Bytes>,
    first_seq: u64,
}

pub(crate) struct ObserverHandle {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl ObserverHandle {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Next queued message, or `None` once the hub has dropped this observer.
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Hub {
    pub(crate) fn spawn(shutdown: CancellationToken) -> Self {
        Self::spawn_with_capacity(INGEST_CAPACITY, OBSERVER_CAPACITY, shutdown)
    }

    pub(crate) fn spawn_with_capacity(
        ingest_capacity: usize,
        observer_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel(ingest_capacity.max(1));
        let inner = Arc::new(HubInner {
            observers: Mutex::new(HashMap::new()),
            ingest_tx,
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            observer_capacity: observer_capacity.max(1),
        });
        tokio::spawn(fan_out_loop(Arc::clone(&inner), ingest_rx, shutdown));
        Self { inner }
    }

    pub(crate) async fn subscribe(&self) -> ObserverHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.observer_capacity);
        let count = {
            let mut observers = self.inner.observers.lock().await;
            let first_seq = self.inner.next_seq.load(Ordering::SeqCst);
            observers.insert(id, Observer { tx, first_seq });
            observers.len()
        };
        tracing::info!(event = "hub.subscribe", observer = id, observers = count);
        ObserverHandle { id, rx }
    }

    pub(crate) async fn unsubscribe(&self, id: u64) {
        let mut observers = self.inner.observers.lock().await;
        if observers.remove(&id).is_some() {
            tracing::info!(
                event = "hub.unsubscribe",
                observer = id,
                observers = observers.len()
            );
        }
    }

    pub(crate) async fn observer_count(&self) -> usize {
        self.inner.observers.lock().await.len()
    }

    /// Queues `message` for every observer. Returns false when the message
    /// was shed because the ingest queue is full or the hub has shut down.
    pub(crate) fn publish(&self, message: impl Into<Bytes>) -> bool {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        match self.inner.ingest_tx.try_send((seq, message.into())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(event = "hub.shed", "ingest queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn publish_frame(&self, frame: &ObserverFrame) -> bool {
        match frame.to_bytes() {
            Ok(payload) => self.publish(payload),
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize observer frame");
                false
            }
        }
    }
}

async fn fan_out_loop(
    inner: Arc<HubInner>,
    mut ingest_rx: mpsc::Receiver<(u64, Bytes)>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = ingest_rx.recv() => {
                let Some((seq, message)) = message else { break };
                inner.deliver(seq, message).await;
            }
        }
    }
    ingest_rx.close();
    inner.observers.lock().await.clear();
}

impl HubInner {
    async fn deliver(&self, seq: u64, message: Bytes) {
        let mut observers = self.observers.lock().await;
        observers.retain(|id, observer| {
            if seq < observer.first_seq {
                return true;
            }
            match observer.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        event = "hub.evict",
                        observer = *id,
                        "observer queue full, disconnecting"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv_timeout(handle: &mut ObserverHandle) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .expect("observer recv timed out")
    }

    #[tokio::test]
    async fn every_observer_gets_every_message_in_order() {
        let hub = Hub::spawn(CancellationToken::new());
        let mut first = hub.subscribe().await;
        let mut second = hub.subscribe().await;
        for i in 0..20 {
            assert!(hub.publish(format!("msg-{i}")));
        }
        for observer in [&mut first, &mut second] {
            for i in 0..20 {
                let message = recv_timeout(observer).await.expect("message");
                assert_eq!(message, Bytes::from(format!("msg-{i}")));
            }
        }
        assert_eq!(hub.observer_count().await, 2);
    }

    #[tokio::test]
    async fn full_observer_is_dropped_without_blocking_publish() {
        let hub = Hub::spawn_with_capacity(64, 4, CancellationToken::new());
        let mut slow = hub.subscribe().await;
        let mut fast = hub.subscribe().await;
        for i in 0..10 {
            assert!(hub.publish(format!("{i}")));
            let got = recv_timeout(&mut fast).await.expect("fast observer stays");
            assert_eq!(got, Bytes::from(format!("{i}")));
        }
        assert_eq!(hub.observer_count().await, 1);

        // The evicted observer keeps what was queued, then sees the close.
        for i in 0..4 {
            assert_eq!(slow.recv().await, Some(Bytes::from(format!("{i}"))));
        }
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn unsubscribed_observer_gets_nothing_further() {
        let hub = Hub::spawn(CancellationToken::new());
        let mut gone = hub.subscribe().await;
        let mut stays = hub.subscribe().await;
        hub.unsubscribe(gone.id()).await;
        assert!(hub.publish("after"));
        assert_eq!(recv_timeout(&mut stays).await, Some(Bytes::from("after")));
        assert_eq!(gone.recv().await, None);
    }

    #[tokio::test]
    async fn publish_sheds_when_ingest_is_full() {
        // Single-threaded runtime: the fan-out task cannot drain until we yield.
        let hub = Hub::spawn_with_capacity(2, 16, CancellationToken::new());
        let mut observer = hub.subscribe().await;
        assert!(hub.publish("a"));
        assert!(hub.publish("b"));
        assert!(!hub.publish("c"));
        assert_eq!(recv_timeout(&mut observer).await, Some(Bytes::from("a")));
        assert_eq!(recv_timeout(&mut observer).await, Some(Bytes::from("b")));
    }

    #[tokio::test]
    async fn late_subscriber_skips_messages_still_queued() {
        // Single-threaded runtime: "before" is still in the ingest queue when
        // the second observer subscribes.
        let hub = Hub::spawn(CancellationToken::new());
        let mut early = hub.subscribe().await;
        assert!(hub.publish("before"));
        let mut late = hub.subscribe().await;
        assert!(hub.publish("after"));

        assert_eq!(recv_timeout(&mut early).await, Some(Bytes::from("before")));
        assert_eq!(recv_timeout(&mut early).await, Some(Bytes::from("after")));
        assert_eq!(recv_timeout(&mut late).await, Some(Bytes::from("after")));
    }

    #[tokio::test]
    async fn shutdown_closes_observers() {
        let shutdown = CancellationToken::new();
        let hub = Hub::spawn(shutdown.clone());
        let mut observer = hub.subscribe().await;
        shutdown.cancel();
        assert_eq!(recv_timeout(&mut observer).await, None);
        assert!(!hub.publish("late"));
    }
}
