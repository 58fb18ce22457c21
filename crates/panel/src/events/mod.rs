mod memory;
mod system;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use protocol::{DomainEvent, EventPage, EventQuery, NewEvent};

pub(crate) use memory::MemoryEventStore;
pub(crate) use system::SystemLogger;

/// Persistence boundary for domain events. The store assigns ids; callers
/// never generate them.
#[async_trait]
pub(crate) trait EventStore: Send + Sync {
    async fn add_event(&self, event: NewEvent) -> anyhow::Result<DomainEvent>;
    async fn get_events(&self, query: &EventQuery) -> anyhow::Result<EventPage>;
    async fn clear_events(&self) -> anyhow::Result<()>;
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
