use async_trait::async_trait;
use protocol::{DomainEvent, EventPage, EventQuery, NewEvent};
use tokio::sync::Mutex;

use super::{now_millis, EventStore};

/// Process-local event store. Ids increase monotonically and are not reused
/// after a clear.
#[derive(Default)]
pub(crate) struct MemoryEventStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    events: Vec<DomainEvent>,
    last_id: i64,
}

impl MemoryEventStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn add_event(&self, mut event: NewEvent) -> anyhow::Result<DomainEvent> {
        if event.time == 0 {
            event.time = now_millis();
        }
        let mut state = self.state.lock().await;
        state.last_id += 1;
        let stored = event.into_event(state.last_id);
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn get_events(&self, query: &EventQuery) -> anyhow::Result<EventPage> {
        let state = self.state.lock().await;
        let search = query
            .search
            .as_deref()
            .filter(|value| !value.is_empty());
        let source = query
            .source
            .as_deref()
            .filter(|value| !value.is_empty());
        let mut matched: Vec<&DomainEvent> = state
            .events
            .iter()
            .filter(|event| source.map_or(true, |source| event.source == source))
            .filter(|event| {
                search.map_or(true, |needle| {
                    event.summary.contains(needle) || event.detail.contains(needle)
                })
            })
            .collect();
        matched.sort_by(|a, b| b.time.cmp(&a.time).then(b.id.cmp(&a.id)));
        let total = matched.len();
        let events = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();
        Ok(EventPage { events, total })
    }

    async fn clear_events(&self) -> anyhow::Result<()> {
        self.state.lock().await.events.clear();
        Ok(())
    }
}
