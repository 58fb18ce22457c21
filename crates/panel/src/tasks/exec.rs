use std::process::Stdio;

use anyhow::Context;
use system_utils::lines::spawn_merged_lines;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Variables every task command sees on top of the panel's environment.
pub(crate) const TASK_ENV: [(&str, &str); 2] = [
    ("DEBIAN_FRONTEND", "noninteractive"),
    ("LANG", "en_US.UTF-8"),
];

const REDACTED: &str = "******";
const LINE_CHANNEL_CAPACITY: usize = 256;

/// One command to run for a task. `stdin` is written once and closed;
/// `secret` is masked in every captured line.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) stdin: Option<String>,
    pub(crate) secret: Option<String>,
}

impl Invocation {
    pub(crate) fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            secret: None,
        }
    }

    /// Runs `body` as root. The password reaches sudo on stdin; it never
    /// appears in argv.
    pub(crate) fn sudo_script(password: &str, body: &str) -> Self {
        Self {
            stdin: Some(format!("{password}\n")),
            secret: Some(password.to_string()).filter(|secret| !secret.is_empty()),
            ..Self::new("sudo", ["-S", "-p", "", "bash", "-c", body])
        }
    }

    fn redact(&self, line: String) -> String {
        match self.secret.as_deref() {
            Some(secret) if line.contains(secret) => line.replace(secret, REDACTED),
            _ => line,
        }
    }
}

/// Spawns the invocation and hands every merged stdout/stderr line to
/// `on_line` in arrival order. Fails on spawn errors and non-zero exits.
pub(crate) async fn run_invocation<F, Fut>(invocation: &Invocation, mut on_line: F) -> anyhow::Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(TASK_ENV)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", invocation.program))?;

    if let (Some(payload), Some(mut stdin)) = (invocation.stdin.as_deref(), child.stdin.take()) {
        // A command that exits without reading stdin closes the pipe early.
        if let Err(err) = stdin.write_all(payload.as_bytes()).await {
            tracing::debug!(event = "task.stdin_failed", error = %err);
        }
        drop(stdin);
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        anyhow::bail!("{} started without output pipes", invocation.program);
    };
    let mut lines = spawn_merged_lines(stdout, stderr, LINE_CHANNEL_CAPACITY);
    while let Some(line) = lines.recv().await {
        on_line(invocation.redact(line)).await;
    }

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for {}", invocation.program))?;
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => anyhow::bail!("exit status {code}"),
        None => anyhow::bail!("terminated by signal"),
    }
}
