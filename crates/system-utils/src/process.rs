use tokio::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Polite request to exit (SIGINT).
    Interrupt,
    /// Unconditional kill (SIGKILL).
    Kill,
}

/// Puts the spawned child in its own session so that signals reach every
/// process it forks.
#[cfg(unix)]
pub fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn apply_process_group(_cmd: &mut Command) {}

/// Whether this platform can ask a process to exit before killing it.
pub fn supports_graceful_stop() -> bool {
    cfg!(unix)
}

/// Signals the process group led by `pid`. Returns false when the signal
/// could not be delivered, including on platforms without signals.
#[cfg(unix)]
pub fn signal_group(pid: u32, termination: Termination) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let signal = match termination {
        Termination::Interrupt => libc::SIGINT,
        Termination::Kill => libc::SIGKILL,
    };
    unsafe { libc::kill(-pid, signal) == 0 }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _termination: Termination) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[test]
    fn interrupt_reaches_process_group() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("sleep 30");
            cmd.stdin(Stdio::null());
            apply_process_group(&mut cmd);
            let mut child = cmd.spawn().expect("spawn");
            let pid = child.id().expect("pid");
            assert!(signal_group(pid, Termination::Interrupt));
            let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .expect("exit in time")
                .expect("wait");
            assert!(!status.success());
        });
    }

    #[test]
    fn signalling_unknown_group_fails() {
        assert!(!signal_group(u32::MAX, Termination::Kill));
    }
}
