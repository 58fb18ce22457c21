use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Full task record, including its output log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "crate::rfc3339")]
    pub created_at: SystemTime,
    #[serde(with = "crate::rfc3339")]
    pub updated_at: SystemTime,
}

/// What a `task_update` frame carries: the task without its log body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    #[serde(with = "crate::rfc3339")]
    pub created_at: SystemTime,
    #[serde(with = "crate::rfc3339")]
    pub updated_at: SystemTime,
    pub log_count: usize,
}

impl From<&TaskSnapshot> for TaskSummary {
    fn from(task: &TaskSnapshot) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            kind: task.kind.clone(),
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            log_count: task.log.len(),
        }
    }
}
