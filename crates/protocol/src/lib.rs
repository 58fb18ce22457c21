use serde::{Deserialize, Serialize};

pub mod events;
pub mod process;
pub mod tasks;

pub use events::{DomainEvent, EventPage, EventQuery, NewEvent};
pub use process::{ProcessState, ProcessStatus};
pub use tasks::{TaskSnapshot, TaskStatus, TaskSummary};

/// JSON frames pushed to observers. Raw agent output is sent as plain text
/// and never goes through this envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ObserverFrame {
    #[serde(rename = "log-entry")]
    LogEntry { data: DomainEvent },
    #[serde(rename = "task_update")]
    TaskUpdate { task: TaskSummary },
    #[serde(rename = "task_log")]
    TaskLog {
        #[serde(rename = "taskId")]
        task_id: String,
        line: String,
    },
}

impl ObserverFrame {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub(crate) mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_rfc3339_seconds(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_rfc3339_weak(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn log_entry_frame_wraps_event_in_data() {
        let frame = ObserverFrame::LogEntry {
            data: DomainEvent {
                id: 7,
                time: 1_700_000_000_000,
                source: "qq".to_string(),
                kind: "notice.poke".to_string(),
                summary: "poke".to_string(),
                detail: String::new(),
            },
        };
        let value: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().expect("encode")).expect("json");
        assert_eq!(value["type"], "log-entry");
        assert_eq!(value["data"]["id"], 7);
        assert_eq!(value["data"]["type"], "notice.poke");
        assert_eq!(value["data"]["detail"], "");
    }

    #[test]
    fn task_frames_use_camel_case_fields() {
        let created = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let frame = ObserverFrame::TaskUpdate {
            task: TaskSummary {
                id: "task-1".to_string(),
                name: "Install Git".to_string(),
                kind: "install_git".to_string(),
                status: TaskStatus::Running,
                progress: 0,
                error: None,
                created_at: created,
                updated_at: created,
                log_count: 3,
            },
        };
        let value: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().expect("encode")).expect("json");
        assert_eq!(value["type"], "task_update");
        assert_eq!(value["task"]["status"], "running");
        assert_eq!(value["task"]["logCount"], 3);
        assert_eq!(value["task"]["createdAt"], "2023-11-14T22:13:20Z");

        let line = ObserverFrame::TaskLog {
            task_id: "task-1".to_string(),
            line: "step1".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&line.to_bytes().expect("encode")).expect("json");
        assert_eq!(value["type"], "task_log");
        assert_eq!(value["taskId"], "task-1");
    }
}
