//! OS process-table cross-check.
//!
//! The waiter task inside [`super::ProcessHandle`] normally observes exits
//! first; this is the independent check the supervisor's monitor loop uses
//! to catch a PID that vanished without the waiter noticing (within one
//! polling interval, per the crash-detection contract).

use sysinfo::{Pid, ProcessRefreshKind, System};

/// Whether `pid` is present in the OS process table.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    sys.refresh_process_specifics(target, ProcessRefreshKind::new());
    sys.process(target).is_some()
}

/// Async wrapper. sysinfo scans the process table synchronously, which
/// would block a tokio worker; run it on the blocking pool instead.
pub async fn pid_alive_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || pid_alive(pid))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn absent_pid_is_dead() {
        // PID values this large are not handed out by any supported OS.
        assert!(!pid_alive_async(u32::MAX - 1).await);
    }
}
