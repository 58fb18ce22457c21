mod exec;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use protocol::{ObserverFrame, TaskSnapshot, TaskStatus, TaskSummary};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::now_millis;
use crate::hub::Hub;

use exec::{run_invocation, Invocation};

pub(crate) const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("a {0} task is already in progress")]
    AlreadyRunning(String),
    #[error("task {id} is {status:?}")]
    InvalidState { id: String, status: TaskStatus },
}

/// Registry and executor for background shell tasks. Every state change is
/// announced as a `task_update` frame and every output line as `task_log`.
/// Tasks only move forward: `pending -> running -> success | failed`. Every
/// task stays retrievable by id for the life of the process; only listings
/// are capped.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    inner: Arc<TaskRunnerInner>,
}

struct TaskRunnerInner {
    hub: Hub,
    history_limit: usize,
    registry: Mutex<TaskRegistry>,
}

#[derive(Default)]
struct TaskRegistry {
    tasks: HashMap<String, TaskSnapshot>,
    last_id_ms: i64,
}

impl TaskRegistry {
    fn insert_pending(&mut self, name: &str, kind: &str) -> TaskSnapshot {
        // Ids stay unique when several tasks are created in the same millisecond.
        let millis = now_millis().max(self.last_id_ms + 1);
        self.last_id_ms = millis;
        let now = SystemTime::now();
        let task = TaskSnapshot {
            id: format!("task-{millis}"),
            name: name.to_string(),
            kind: kind.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            log: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(task.id.clone(), task.clone());
        task
    }

    fn has_active(&self, kind: &str) -> bool {
        self.tasks
            .values()
            .any(|task| task.kind == kind && task.status.is_active())
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut TaskSnapshot, TaskError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }
}

impl TaskRunner {
    pub(crate) fn new(hub: Hub, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(TaskRunnerInner {
                hub,
                history_limit: history_limit.max(1),
                registry: Mutex::new(TaskRegistry::default()),
            }),
        }
    }

    /// Registers a pending task. Does not check for duplicates; see
    /// [`TaskRunner::admit_task`].
    pub(crate) async fn create_task(&self, name: &str, kind: &str) -> TaskSnapshot {
        let task = {
            let mut registry = self.inner.registry.lock().await;
            registry.insert_pending(name, kind)
        };
        self.publish_update(&task);
        task
    }

    /// Check-and-create in one step: fails if a pending or running task of
    /// the same type exists.
    pub(crate) async fn admit_task(&self, name: &str, kind: &str) -> Result<TaskSnapshot, TaskError> {
        let task = {
            let mut registry = self.inner.registry.lock().await;
            if registry.has_active(kind) {
                return Err(TaskError::AlreadyRunning(kind.to_string()));
            }
            registry.insert_pending(name, kind)
        };
        self.publish_update(&task);
        Ok(task)
    }

    /// Advisory: only `running` tasks count, so two callers racing between
    /// this and `create_task` can both get through.
    pub(crate) async fn has_running_task(&self, kind: &str) -> bool {
        self.inner
            .registry
            .lock()
            .await
            .tasks
            .values()
            .any(|task| task.kind == kind && task.status == TaskStatus::Running)
    }

    pub(crate) async fn get_task(&self, id: &str) -> Option<TaskSnapshot> {
        self.inner.registry.lock().await.tasks.get(id).cloned()
    }

    /// Newest first, at most `history_limit` entries.
    pub(crate) async fn recent_tasks(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self
            .inner
            .registry
            .lock()
            .await
            .tasks
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| task_seq(&b.id).cmp(&task_seq(&a.id)))
        });
        tasks.truncate(self.inner.history_limit);
        tasks
    }

    pub(crate) async fn run_command<I, S>(&self, id: &str, program: &str, args: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(id, &Invocation::new(program, args)).await
    }

    pub(crate) async fn run_script(&self, id: &str, script: &str) -> anyhow::Result<()> {
        self.run_command(id, "bash", ["-c", script]).await
    }

    pub(crate) async fn run_script_with_sudo(
        &self,
        id: &str,
        password: &str,
        script: &str,
    ) -> anyhow::Result<()> {
        self.run(id, &Invocation::sudo_script(password, script)).await
    }

    /// Marks the task running, streams its output and reports the outcome.
    /// The terminal status is left to [`TaskRunner::finish_task`].
    async fn run(&self, id: &str, invocation: &Invocation) -> anyhow::Result<()> {
        let task = self
            .update(id, |task| {
                if task.status != TaskStatus::Pending {
                    return Err(invalid_state(task));
                }
                task.status = TaskStatus::Running;
                Ok(())
            })
            .await?;
        self.publish_update(&task);
        info!(event = "task.running", task_id = %id, program = %invocation.program);
        run_invocation(invocation, |line| self.append_line(id, line)).await
    }

    pub(crate) async fn finish_task(&self, id: &str, result: anyhow::Result<()>) -> Result<(), TaskError> {
        let task = self
            .update(id, |task| {
                if task.status.is_terminal() {
                    return Err(invalid_state(task));
                }
                match &result {
                    Ok(()) => {
                        task.status = TaskStatus::Success;
                        task.progress = 100;
                        task.error = None;
                        task.log.push("✅ done".to_string());
                    }
                    Err(err) => {
                        let message = format!("{err:#}");
                        task.status = TaskStatus::Failed;
                        task.log.push(format!("❌ failed: {message}"));
                        task.error = Some(message);
                    }
                }
                Ok(())
            })
            .await?;
        match &task.error {
            Some(error) => warn!(event = "task.failed", task_id = %task.id, name = %task.name, error = %error),
            None => info!(event = "task.succeeded", task_id = %task.id, name = %task.name),
        }
        self.publish_update(&task);
        Ok(())
    }

    /// Runs `script` for an already admitted task in the background, as root
    /// when a sudo password is given, and finishes the task with the outcome.
    pub(crate) fn spawn_script(
        &self,
        id: String,
        script: String,
        sudo_password: Option<String>,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            let result = match sudo_password {
                Some(password) => runner.run_script_with_sudo(&id, &password, &script).await,
                None => runner.run_script(&id, &script).await,
            };
            if let Err(err) = runner.finish_task(&id, result).await {
                warn!(event = "task.finish_failed", task_id = %id, error = %err);
            }
        })
    }

    async fn append_line(&self, id: &str, line: String) {
        let appended = self
            .update(id, |task| {
                task.log.push(line.clone());
                Ok(())
            })
            .await
            .is_ok();
        if appended {
            self.inner.hub.publish_frame(&ObserverFrame::TaskLog {
                task_id: id.to_string(),
                line,
            });
        }
    }

    async fn update<F>(&self, id: &str, change: F) -> Result<TaskSnapshot, TaskError>
    where
        F: FnOnce(&mut TaskSnapshot) -> Result<(), TaskError>,
    {
        let mut registry = self.inner.registry.lock().await;
        let task = registry.get_mut(id)?;
        change(task)?;
        task.updated_at = SystemTime::now();
        Ok(task.clone())
    }

    fn publish_update(&self, task: &TaskSnapshot) {
        self.inner.hub.publish_frame(&ObserverFrame::TaskUpdate {
            task: TaskSummary::from(task),
        });
    }
}

fn invalid_state(task: &TaskSnapshot) -> TaskError {
    TaskError::InvalidState {
        id: task.id.clone(),
        status: task.status,
    }
}

fn task_seq(id: &str) -> i64 {
    id.strip_prefix("task-")
        .and_then(|millis| millis.parse().ok())
        .unwrap_or(0)
}
