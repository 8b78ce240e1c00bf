//! Process handle - direct child-process spawning with stdio capture
//!
//! One `ProcessHandle` wraps one OS child process:
//! - stdout/stderr captured line by line into the shared [`ConsoleBus`]
//! - stdin command injection via an mpsc channel
//! - exit detection through a watch channel plus the recorded exit code
//! - graceful (SIGTERM) and forced (SIGKILL) termination

pub mod monitor;

use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};

use crate::console::{ConsoleBus, LineSource, LogLevel};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process is not running")]
    NotRunning,
}

/// A running (or recently exited) child process. All I/O is serviced by
/// background tasks spawned at creation; the handle itself is cheap to
/// share behind an `Arc`.
pub struct ProcessHandle {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    running_rx: watch::Receiver<bool>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

impl ProcessHandle {
    /// Spawn a child process with piped stdio. Captured output flows into
    /// `bus`; the returned handle outlives the process and keeps serving
    /// `exit_code()` after termination.
    pub async fn spawn(
        program: &str,
        args: &[String],
        working_dir: &Path,
        bus: Arc<ConsoleBus>,
    ) -> Result<Self, ProcessError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            program: program.to_string(),
            source: std::io::Error::other("spawned process has no PID"),
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);
        let (running_tx, running_rx) = watch::channel(true);
        let exit_code = Arc::new(Mutex::new(None));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    bus.append_output(LineSource::Stdout, line);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    bus.append_output(LineSource::Stderr, line);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') { cmd } else { format!("{}\n", cmd) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let bus = bus.clone();
            let exit_code = exit_code.clone();
            tokio::spawn(async move {
                let msg = match child.wait().await {
                    Ok(status) => {
                        let code = status.code();
                        *exit_code.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(code.unwrap_or(-1));
                        format!("Server process exited with {}", status)
                    }
                    Err(e) => {
                        *exit_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(-1);
                        format!("Failed to wait for server process: {}", e)
                    }
                };
                tracing::info!("{}", msg);
                bus.append(LineSource::System, msg, LogLevel::Info);
                let _ = running_tx.send(false);
            });
        }

        tracing::info!("Spawned '{}' with PID {}", program, pid);
        Ok(Self {
            pid,
            stdin_tx,
            running_rx,
            exit_code,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has not yet been observed to exit.
    pub fn is_alive(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Exit code, once the process has terminated. Signal deaths report -1.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one line to the process's stdin.
    pub async fn send_line(&self, text: &str) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Err(ProcessError::NotRunning);
        }
        self.stdin_tx
            .send(text.to_string())
            .await
            .map_err(|_| ProcessError::NotRunning)
    }

    /// Wait until the process exits. Returns immediately if it already has.
    pub async fn wait_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Signal the process to terminate. `force: false` sends a polite
    /// termination signal; `force: true` kills outright.
    pub fn terminate(&self, force: bool) {
        if !self.is_alive() {
            return;
        }
        let signal_name = if force { "KILL" } else { "TERM" };
        tracing::info!("Sending {} to PID {}", signal_name, self.pid);
        if let Err(e) = signal_pid(self.pid, force) {
            tracing::warn!("Failed to signal PID {}: {}", self.pid, e);
        }
    }
}

// ─── Platform helpers ────────────────────────────────────────

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) -> anyhow::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal::kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| anyhow::anyhow!("kill({}, {:?}): {}", pid, signal, e))
}

#[cfg(windows)]
fn signal_pid(pid: u32, force: bool) -> anyhow::Result<()> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            anyhow::bail!("failed to open process {}", pid);
        }
        let exit_code = if force { 1 } else { 0 };
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            anyhow::bail!("TerminateProcess failed for {}", pid);
        }
    }
    Ok(())
}

/// Hide the console window on Windows; no-op elsewhere.
#[cfg(target_os = "windows")]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn apply_creation_flags(cmd: &mut TokioCommand) -> &mut TokioCommand {
    cmd
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let bus = Arc::new(ConsoleBus::default());
        let result = ProcessHandle::spawn(
            "definitely-not-a-real-binary",
            &[],
            Path::new("."),
            bus,
        )
        .await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn captures_stdout_and_exit() {
        let bus = Arc::new(ConsoleBus::default());
        let handle = ProcessHandle::spawn("sh", &sh("echo hello"), Path::new("."), bus.clone())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .expect("process should exit promptly");

        assert!(!handle.is_alive());
        assert_eq!(handle.exit_code(), Some(0));

        // The echoed line and the exit notice both land on the bus.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = bus.get_recent(100);
        assert!(lines.iter().any(|l| l.source == LineSource::Stdout && l.text == "hello"));
        assert!(lines.iter().any(|l| l.source == LineSource::System));
    }

    #[tokio::test]
    async fn stdin_injection_reaches_child() {
        let bus = Arc::new(ConsoleBus::default());
        let handle = ProcessHandle::spawn(
            "sh",
            &sh("read line; echo \"got:$line\""),
            Path::new("."),
            bus.clone(),
        )
        .await
        .unwrap();

        handle.send_line("ping").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .expect("process should exit after reading one line");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let lines = bus.get_recent(100);
        assert!(lines.iter().any(|l| l.text == "got:ping"));
    }

    #[tokio::test]
    async fn force_terminate_kills_sleeper() {
        let bus = Arc::new(ConsoleBus::default());
        let handle = ProcessHandle::spawn("sh", &sh("sleep 30"), Path::new("."), bus)
            .await
            .unwrap();

        assert!(handle.is_alive());
        handle.terminate(true);
        tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .expect("killed process should exit");
        assert_eq!(handle.exit_code(), Some(-1), "signal death reports -1");
    }

    #[tokio::test]
    async fn send_line_after_exit_is_not_running() {
        let bus = Arc::new(ConsoleBus::default());
        let handle = ProcessHandle::spawn("sh", &sh("true"), Path::new("."), bus)
            .await
            .unwrap();
        handle.wait_exit().await;
        assert!(matches!(
            handle.send_line("stop").await,
            Err(ProcessError::NotRunning)
        ));
    }
}
