mod locate;
mod log_buffer;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::{ProcessState, ProcessStatus};
use system_utils::lines::spawn_merged_lines;
use system_utils::process::{apply_process_group, signal_group, supports_graceful_stop, Termination};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hub::Hub;

pub(crate) use locate::locate_binary;
use log_buffer::LogBuffer;

pub(crate) const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const RESTART_PAUSE: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(2);
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub(crate) enum SupervisorError {
    #[error("agent is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },
    #[error("agent is not running")]
    NotRunning,
    #[error("agent executable `{name}` not found; install it or set agent.binary")]
    BinaryNotFound { name: String },
    #[error("failed to spawn agent: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub(crate) struct SupervisorSettings {
    pub(crate) agent_dir: PathBuf,
    pub(crate) binary: Option<PathBuf>,
    pub(crate) binary_name: String,
    pub(crate) subcommand: String,
    pub(crate) dir_env: String,
    pub(crate) log_capacity: usize,
    pub(crate) stop_grace: Duration,
    pub(crate) home: Option<PathBuf>,
    pub(crate) search_path: Option<OsString>,
}

/// Owns the lifecycle of the single agent process:
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, plus
/// `Running -> Stopped` when the agent exits on its own.
#[derive(Clone)]
pub(crate) struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    settings: SupervisorSettings,
    hub: Hub,
    record: Mutex<ProcessRecord>,
    logs: Mutex<LogBuffer>,
}

struct ProcessRecord {
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<SystemTime>,
    exit_code: Option<i32>,
    // Bumped on every spawn so a stale waiter or stop cannot clobber a
    // newer process.
    generation: u64,
    exit: Option<ExitWatch>,
}

struct ExitWatch {
    exited: watch::Receiver<bool>,
    kill: CancellationToken,
}

impl Supervisor {
    pub(crate) fn new(settings: SupervisorSettings, hub: Hub) -> Self {
        let logs = LogBuffer::new(settings.log_capacity);
        Self {
            inner: Arc::new(SupervisorInner {
                settings,
                hub,
                record: Mutex::new(ProcessRecord {
                    state: ProcessState::Stopped,
                    pid: None,
                    started_at: None,
                    exit_code: None,
                    generation: 0,
                    exit: None,
                }),
                logs: Mutex::new(logs),
            }),
        }
    }

    pub(crate) async fn start(&self) -> Result<ProcessStatus, SupervisorError> {
        let settings = &self.inner.settings;
        let mut record = self.inner.record.lock().await;
        if record.state != ProcessState::Stopped {
            return Err(SupervisorError::AlreadyRunning { pid: record.pid });
        }
        let binary = locate_binary(
            settings.binary.as_deref(),
            &settings.binary_name,
            settings.home.as_deref(),
            settings.search_path.as_deref(),
        )
        .ok_or_else(|| SupervisorError::BinaryNotFound {
            name: settings.binary_name.clone(),
        })?;

        record.state = ProcessState::Starting;
        let mut cmd = Command::new(&binary);
        cmd.arg(&settings.subcommand)
            .current_dir(&settings.agent_dir)
            .env(&settings.dir_env, &settings.agent_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        apply_process_group(&mut cmd);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                record.state = ProcessState::Stopped;
                return Err(SupervisorError::Spawn(err));
            }
        };

        let pid = child.id();
        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            let lines = spawn_merged_lines(stdout, stderr, OUTPUT_CHANNEL_CAPACITY);
            tokio::spawn(pump_output(Arc::clone(&self.inner), lines));
        }

        record.generation += 1;
        let generation = record.generation;
        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(wait_for_exit(
            Arc::clone(&self.inner),
            child,
            generation,
            kill.clone(),
            exited_tx,
        ));

        record.state = ProcessState::Running;
        record.pid = pid;
        record.started_at = Some(SystemTime::now());
        record.exit_code = None;
        record.exit = Some(ExitWatch {
            exited: exited_rx,
            kill,
        });
        info!(
            event = "agent.started",
            pid = ?pid,
            binary = %binary.display(),
            dir = %settings.agent_dir.display()
        );
        Ok(snapshot(&record))
    }

    /// Asks the agent to exit, force-killing it after the grace period. The
    /// record always ends up `Stopped`.
    pub(crate) async fn stop(&self) -> Result<ProcessStatus, SupervisorError> {
        let (pid, generation, mut exited, kill) = {
            let mut record = self.inner.record.lock().await;
            if record.state != ProcessState::Running {
                return Err(SupervisorError::NotRunning);
            }
            let Some(exit) = record.exit.as_ref() else {
                return Err(SupervisorError::NotRunning);
            };
            let handles = (exit.exited.clone(), exit.kill.clone());
            record.state = ProcessState::Stopping;
            (record.pid, record.generation, handles.0, handles.1)
        };
        info!(event = "agent.stopping", pid = ?pid);

        let signalled = supports_graceful_stop()
            && pid.is_some_and(|pid| signal_group(pid, Termination::Interrupt));
        let exited_in_time = signalled
            && tokio::time::timeout(
                self.inner.settings.stop_grace,
                exited.wait_for(|done| *done),
            )
            .await
            .is_ok();
        if !exited_in_time {
            if signalled {
                warn!(
                    event = "agent.stop_timeout",
                    pid = ?pid,
                    grace_ms = self.inner.settings.stop_grace.as_millis() as u64,
                    "agent ignored interrupt, killing"
                );
            }
            kill.cancel();
            if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
                .await
                .is_err()
            {
                warn!(event = "agent.kill_timeout", pid = ?pid, "agent still running after kill");
            }
        }

        let mut record = self.inner.record.lock().await;
        if record.generation == generation {
            record.state = ProcessState::Stopped;
            record.pid = None;
            record.exit = None;
        }
        info!(event = "agent.stopped", pid = ?pid);
        Ok(snapshot(&record))
    }

    pub(crate) async fn restart(&self) -> Result<ProcessStatus, SupervisorError> {
        if self.status().await.running {
            if let Err(err) = self.stop().await {
                warn!(event = "agent.restart_stop_failed", error = %err);
            }
            tokio::time::sleep(RESTART_PAUSE).await;
        }
        self.start().await
    }

    /// Shutdown path: stops the agent if it is up, never fails.
    pub(crate) async fn stop_all(&self) {
        if self.status().await.running {
            if let Err(err) = self.stop().await {
                warn!(event = "agent.stop_all_failed", error = %err);
            }
        }
    }

    pub(crate) async fn status(&self) -> ProcessStatus {
        snapshot(&*self.inner.record.lock().await)
    }

    pub(crate) async fn logs(&self, n: usize) -> Vec<String> {
        self.inner.logs.lock().await.tail(n)
    }
}

fn snapshot(record: &ProcessRecord) -> ProcessStatus {
    let running = record.state != ProcessState::Stopped;
    let uptime = match (running, record.started_at) {
        (true, Some(started_at)) => started_at.elapsed().map(|d| d.as_secs()).unwrap_or(0),
        _ => 0,
    };
    ProcessStatus {
        state: record.state,
        running,
        pid: if running { record.pid } else { None },
        started_at: record.started_at.map(system_time_ms),
        uptime,
        exit_code: record.exit_code,
    }
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

async fn pump_output(inner: Arc<SupervisorInner>, mut lines: tokio::sync::mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        inner.logs.lock().await.push(line.clone());
        inner.hub.publish(line);
    }
}

async fn wait_for_exit(
    inner: Arc<SupervisorInner>,
    mut child: Child,
    generation: u64,
    kill: CancellationToken,
    exited: watch::Sender<bool>,
) {
    let pid = child.id();
    let mut killing = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = kill.cancelled(), if !killing => {
                killing = true;
                if let Some(pid) = pid {
                    signal_group(pid, Termination::Kill);
                }
                if let Err(err) = child.start_kill() {
                    warn!(event = "agent.kill_failed", pid = ?pid, error = %err);
                }
            }
        }
    };
    let exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            warn!(event = "agent.wait_failed", pid = ?pid, error = %err);
            -1
        }
    };
    {
        let mut record = inner.record.lock().await;
        if record.generation == generation {
            record.state = ProcessState::Stopped;
            record.pid = None;
            record.exit_code = Some(exit_code);
            record.exit = None;
        }
    }
    info!(event = "agent.exited", pid = ?pid, exit_code);
    exited.send_replace(true);
}
