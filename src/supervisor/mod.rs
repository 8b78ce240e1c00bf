//! Server supervisor - the lifecycle state machine around one child process.
//!
//! The supervisor is the single writer of lifecycle state and the only
//! component allowed to spawn or kill the server process. Transitions are
//! serialized through a transition guard; a start/stop arriving while
//! another transition is in flight fails with `TransitionInProgress`
//! instead of queuing. Every transition is also announced as a synthetic
//! system line on the console bus, so the operator interface and the
//! tests can follow the lifecycle through the console stream alone.

pub mod error;
pub mod state_machine;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::console::{current_timestamp, ConsoleBus, ConsoleLine, LineSource, LogLevel};
use crate::instance::ServerInstance;
use crate::process::{monitor, ProcessHandle};
use error::SupervisorError;
use state_machine::{LifecycleState, StateMachine};

/// Tuning knobs for start/stop behavior. Defaults mirror a stock
/// Minecraft server; tests substitute much shorter timeouts.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Regex matched against stdout lines to detect startup completion
    pub ready_pattern: String,
    /// Command written to the server's stdin for a graceful shutdown
    pub stop_command: String,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            ready_pattern: crate::config::DEFAULT_READY_PATTERN.to_string(),
            stop_command: "stop".to_string(),
            start_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the supervised server, for the IPC layer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
}

pub struct Supervisor {
    /// Self-reference handed to spawned watcher tasks.
    weak: std::sync::Weak<Self>,
    instance: Arc<ServerInstance>,
    bus: Arc<ConsoleBus>,
    ready_regex: Option<Regex>,
    opts: SupervisorOptions,
    state: Mutex<StateMachine>,
    /// Held for the duration of every lifecycle transition. try_lock
    /// losers get `TransitionInProgress`; the crash path waits instead.
    transition: tokio::sync::Mutex<()>,
    handle: Mutex<Option<Arc<ProcessHandle>>>,
    /// Bumped whenever the tracked process changes; stale crash watchers
    /// compare against it and stand down.
    generation: AtomicU64,
    started_at: Mutex<Option<u64>>,
}

impl Supervisor {
    pub fn new(
        instance: Arc<ServerInstance>,
        bus: Arc<ConsoleBus>,
        opts: SupervisorOptions,
    ) -> Arc<Self> {
        let ready_regex = match Regex::new(&opts.ready_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid ready pattern '{}': {}", opts.ready_pattern, e);
                None
            }
        };
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            instance,
            bus,
            ready_regex,
            opts,
            state: Mutex::new(StateMachine::new()),
            transition: tokio::sync::Mutex::new(()),
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
            started_at: Mutex::new(None),
        })
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    pub fn current_state(&self) -> LifecycleState {
        self.lock_state().current()
    }

    pub fn console_bus(&self) -> &Arc<ConsoleBus> {
        &self.bus
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleLine> {
        self.bus.subscribe()
    }

    pub fn console_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.bus.get_since(since_id)
    }

    pub fn console_recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.bus.get_recent(count)
    }

    pub fn status(&self) -> StatusSnapshot {
        let pid = self.current_handle().map(|h| h.pid());
        let uptime_seconds = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| current_timestamp().saturating_sub(t));
        StatusSnapshot {
            name: self.instance.name.clone(),
            state: self.current_state(),
            pid,
            uptime_seconds,
        }
    }

    // ── Lifecycle operations ─────────────────────────────────

    /// Start the server. Only valid from `Stopped`; the directory must be
    /// bootstrapped. Waits for the ready line (or the start timeout)
    /// before reporting success.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| SupervisorError::TransitionInProgress)?;

        let state = self.current_state();
        if state != LifecycleState::Stopped {
            return Err(SupervisorError::AlreadyRunning(state));
        }
        self.instance.check_bootstrapped()?;

        self.set_state(LifecycleState::Starting);

        // Subscribe before spawning so the ready line cannot slip past.
        let ready_rx = self.bus.subscribe();
        let (program, args) = self.instance.launch_command();
        let handle = match ProcessHandle::spawn(
            &program,
            &args,
            &self.instance.root_dir,
            self.bus.clone(),
        )
        .await
        {
            Ok(h) => Arc::new(h),
            Err(e) => {
                self.set_state(LifecycleState::Crashed);
                return Err(e.into());
            }
        };

        *self.lock_handle() = Some(handle.clone());
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(current_timestamp());

        match self.wait_for_ready(ready_rx, &handle).await {
            ReadyOutcome::Ready => {
                self.set_state(LifecycleState::Running);
            }
            ReadyOutcome::TimedOutAlive => {
                tracing::warn!(
                    "No ready line within {:?}, but PID {} is alive; assuming running",
                    self.opts.start_timeout,
                    handle.pid()
                );
                self.set_state(LifecycleState::Running);
            }
            ReadyOutcome::Exited => {
                let code = handle.exit_code();
                self.set_state(LifecycleState::Crashed);
                *self.lock_handle() = None;
                self.generation.fetch_add(1, Ordering::SeqCst);
                return Err(SupervisorError::SpawnFailed(format!(
                    "server exited during startup (exit code {:?})",
                    code
                )));
            }
        }

        self.spawn_crash_watcher(handle);
        Ok(())
    }

    /// Stop the server gracefully, force-killing after the grace period.
    /// Only valid from `Running`.
    pub async fn stop(&self, grace: Option<Duration>) -> Result<(), SupervisorError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| SupervisorError::TransitionInProgress)?;

        let state = self.current_state();
        if state != LifecycleState::Running {
            return Err(SupervisorError::NotRunning(state));
        }
        let Some(handle) = self.current_handle() else {
            // No live handle but state says Running: reconcile to Stopped.
            tracing::error!("Running state without a process handle; resetting");
            self.set_state(LifecycleState::Stopping);
            self.finish_stop();
            return Ok(());
        };

        self.set_state(LifecycleState::Stopping);

        if handle.send_line(&self.opts.stop_command).await.is_err() {
            // stdin already gone; fall back to the polite signal
            handle.terminate(false);
        }

        let grace = grace.unwrap_or(self.opts.stop_grace);
        if tokio::time::timeout(grace, handle.wait_exit()).await.is_err() {
            self.bus.append(
                LineSource::System,
                format!("Grace period ({}s) elapsed, force-killing server", grace.as_secs()),
                LogLevel::Warn,
            );
            handle.terminate(true);
            if tokio::time::timeout(Duration::from_secs(10), handle.wait_exit())
                .await
                .is_err()
            {
                tracing::error!("PID {} survived SIGKILL wait; giving up", handle.pid());
            }
        }

        self.finish_stop();
        Ok(())
    }

    /// Inject a command line into the server's stdin. Only valid while
    /// `Running`; the injected line is echoed onto the console bus.
    pub async fn send_command(&self, text: &str) -> Result<(), SupervisorError> {
        let state = self.current_state();
        if state != LifecycleState::Running {
            return Err(SupervisorError::NotRunning(state));
        }
        let handle = self
            .current_handle()
            .ok_or(SupervisorError::NotRunning(state))?;
        self.bus
            .append(LineSource::Command, text.to_string(), LogLevel::Info);
        handle.send_line(text).await?;
        Ok(())
    }

    /// Reset `Crashed` back to `Stopped` so the server can be started
    /// again. Idempotent from `Stopped`.
    pub async fn acknowledge(&self) -> Result<(), SupervisorError> {
        let _guard = self
            .transition
            .try_lock()
            .map_err(|_| SupervisorError::TransitionInProgress)?;
        match self.current_state() {
            LifecycleState::Crashed => {
                *self.lock_handle() = None;
                self.set_state(LifecycleState::Stopped);
                Ok(())
            }
            LifecycleState::Stopped => Ok(()),
            other => Err(SupervisorError::AlreadyRunning(other)),
        }
    }

    /// One monitor cycle: cross-check the tracked PID against the OS
    /// process table. Catches exits the in-process waiter missed.
    pub async fn monitor_tick(&self) {
        if self.current_state() != LifecycleState::Running {
            return;
        }
        let Some(handle) = self.current_handle() else { return };
        if !handle.is_alive() || !monitor::pid_alive_async(handle.pid()).await {
            let generation = self.generation.load(Ordering::SeqCst);
            self.handle_unexpected_exit(generation).await;
        }
    }

    /// Graceful daemon shutdown: stop a running server with the default
    /// grace period; anything else is left as-is.
    pub async fn shutdown(&self) {
        if self.current_state() == LifecycleState::Running {
            if let Err(e) = self.stop(None).await {
                tracing::warn!("Shutdown stop failed: {}", e);
            }
        }
    }

    // ── Internals ────────────────────────────────────────────

    fn spawn_crash_watcher(&self, handle: Arc<ProcessHandle>) {
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(supervisor) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            handle.wait_exit().await;
            supervisor.handle_unexpected_exit(generation).await;
        });
    }

    /// Called when the tracked process exits without a stop() in flight.
    /// Waits for the transition guard (a concurrent stop() wins the race
    /// and this becomes a no-op via the generation/state checks).
    async fn handle_unexpected_exit(&self, generation: u64) {
        let _guard = self.transition.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.current_state() != LifecycleState::Running {
            return;
        }
        let code = self.current_handle().and_then(|h| h.exit_code());
        self.bus.append(
            LineSource::System,
            format!("Server process exited unexpectedly (exit code {:?})", code),
            LogLevel::Error,
        );
        self.set_state(LifecycleState::Crashed);
        *self.lock_handle() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn finish_stop(&self) {
        self.set_state(LifecycleState::Stopped);
        *self.lock_handle() = None;
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Apply a transition and announce it on the console bus. All call
    /// sites run under the transition guard against a checked state, so a
    /// table violation here is a supervisor bug worth shouting about.
    fn set_state(&self, to: LifecycleState) {
        let mut sm = self.lock_state();
        let from = sm.current();
        if let Err(e) = sm.transition(to) {
            tracing::error!("{}", e);
            return;
        }
        drop(sm);
        self.bus.append(
            LineSource::System,
            format!("Lifecycle: {} -> {}", from, to),
            LogLevel::Info,
        );
    }

    fn current_handle(&self) -> Option<Arc<ProcessHandle>> {
        self.lock_handle().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StateMachine> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<Arc<ProcessHandle>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_for_ready(
        &self,
        mut rx: broadcast::Receiver<ConsoleLine>,
        handle: &ProcessHandle,
    ) -> ReadyOutcome {
        let Some(ready) = &self.ready_regex else {
            // No usable pattern: consider a surviving spawn ready.
            return ReadyOutcome::Ready;
        };
        let watch_lines = async {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if line.source == LineSource::Stdout && ready.is_match(&line.text) {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Console subscriber lagged {} lines during startup", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        let outcome = tokio::time::timeout(self.opts.start_timeout, async {
            tokio::select! {
                _ = watch_lines => ReadyOutcome::Ready,
                _ = handle.wait_exit() => ReadyOutcome::Exited,
            }
        })
        .await;
        match outcome {
            Ok(o) => o,
            Err(_) if handle.is_alive() => ReadyOutcome::TimedOutAlive,
            Err(_) => ReadyOutcome::Exited,
        }
    }
}

enum ReadyOutcome {
    Ready,
    Exited,
    TimedOutAlive,
}

// ─── Tests ───────────────────────────────────────────────────
