use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of the supervised agent. Uptime is derived at the
/// moment the snapshot is taken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub running: bool,
    pub pid: Option<u32>,
    /// Epoch milliseconds.
    pub started_at: Option<u64>,
    /// Seconds; zero unless running.
    pub uptime: u64,
    pub exit_code: Option<i32>,
}
