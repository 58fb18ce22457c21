use serde::{Deserialize, Serialize};

/// A persisted occurrence, as stored by the event store and shown in the
/// activity log. `id` is assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainEvent {
    pub id: i64,
    /// Epoch milliseconds.
    pub time: i64,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

/// An event that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEvent {
    #[serde(default)]
    pub time: i64,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

impl NewEvent {
    pub fn new(
        time: i64,
        source: impl Into<String>,
        kind: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            time,
            source: source.into(),
            kind: kind.into(),
            summary: summary.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn into_event(self, id: i64) -> DomainEvent {
        DomainEvent {
            id,
            time: self.time,
            source: self.source,
            kind: self.kind,
            summary: self.summary,
            detail: self.detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
}

fn default_limit() -> usize {
    100
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
            source: None,
            search: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<DomainEvent>,
    /// Number of events matching the filters, ignoring limit and offset.
    pub total: usize,
}
