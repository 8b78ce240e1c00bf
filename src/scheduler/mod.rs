//! Daily job scheduler - timed restart and backup triggers.
//!
//! One timing loop serves every job: it computes each enabled job's next
//! fire time ("today at the trigger if still in the future, else
//! tomorrow"), sleeps until the nearest one, fires whatever is due, and
//! rearms. Job edits wake the loop immediately; daemon shutdown cancels
//! it through a `CancellationToken`. A job that fails is recorded as
//! failed and stays armed for the next day.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backup::BackupEngine;
use crate::config::SchedulerConfig;
use crate::console::{LineSource, LogLevel};
use crate::supervisor::state_machine::LifecycleState;
use crate::supervisor::Supervisor;

pub const DEFAULT_RESTART_TRIGGER: &str = "04:00";
pub const DEFAULT_BACKUP_TRIGGER: &str = "03:00";

/// How long to sleep when no job is enabled. Purely a rearm bound; the
/// Notify wakes the loop as soon as a job is edited.
const IDLE_REARM: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Restart,
    Backup,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restart => f.write_str("restart"),
            Self::Backup => f.write_str("backup"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "backup" => Ok(Self::Backup),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub kind: JobKind,
    /// Daily wall-clock trigger, local time
    #[serde(serialize_with = "serialize_trigger")]
    pub trigger: NaiveTime,
    pub enabled: bool,
    pub last_run: Option<DateTime<Local>>,
    pub last_result: Option<JobResult>,
}

fn serialize_trigger<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&t.format("%H:%M").to_string())
}

impl ScheduledJob {
    pub fn new(kind: JobKind, trigger: NaiveTime, enabled: bool) -> Self {
        Self {
            kind,
            trigger,
            enabled,
            last_run: None,
            last_result: None,
        }
    }

    /// Next fire time: today at the trigger if that is still ahead and
    /// the job has not already run today, else tomorrow. Disabled jobs
    /// never fire.
    pub fn next_fire(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        if !self.enabled {
            return None;
        }
        let mut date = now.date_naive();
        if let Some(last) = self.last_run {
            if last.with_timezone(&Local).date_naive() >= date {
                date = date.succ_opt()?;
            }
        }
        // A couple of extra days of slack covers DST gaps that swallow
        // the trigger time entirely.
        for _ in 0..3 {
            if let Some(candidate) = date.and_time(self.trigger).and_local_timezone(Local).earliest()
            {
                if candidate > now {
                    return Some(candidate);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

/// Parse a "HH:MM" (or "HH:MM:SS") trigger.
pub fn parse_trigger(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| anyhow::anyhow!("invalid trigger time '{}': {}", s, e))
}

pub struct Scheduler {
    supervisor: Arc<Supervisor>,
    backups: Arc<BackupEngine>,
    jobs: Mutex<Vec<ScheduledJob>>,
    notify: Notify,
    /// Whether a restart job may start a server the operator stopped.
    restart_when_stopped: bool,
}

impl Scheduler {
    /// Build the two jobs from config. A missing trigger time leaves the
    /// job disabled at its default trigger, editable over IPC later.
    pub fn new(
        supervisor: Arc<Supervisor>,
        backups: Arc<BackupEngine>,
        cfg: &SchedulerConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let restart_trigger = cfg
            .restart_time
            .as_deref()
            .unwrap_or(DEFAULT_RESTART_TRIGGER);
        let backup_trigger = cfg.backup_time.as_deref().unwrap_or(DEFAULT_BACKUP_TRIGGER);
        let jobs = vec![
            ScheduledJob::new(
                JobKind::Restart,
                parse_trigger(restart_trigger)?,
                cfg.restart_time.is_some(),
            ),
            ScheduledJob::new(
                JobKind::Backup,
                parse_trigger(backup_trigger)?,
                cfg.backup_time.is_some(),
            ),
        ];
        Ok(Arc::new(Self {
            supervisor,
            backups,
            jobs: Mutex::new(jobs),
            notify: Notify::new(),
            restart_when_stopped: cfg.restart_when_stopped,
        }))
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.lock_jobs().clone()
    }

    /// Operator edit of a job's trigger time and/or enabled flag. Wakes
    /// the timing loop so the change takes effect immediately.
    pub fn edit(&self, kind: JobKind, trigger: Option<NaiveTime>, enabled: Option<bool>) {
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.iter_mut().find(|j| j.kind == kind) {
                if let Some(t) = trigger {
                    job.trigger = t;
                }
                if let Some(e) = enabled {
                    job.enabled = e;
                }
                tracing::info!(
                    "Job {} edited: trigger {}, enabled {}",
                    kind,
                    job.trigger.format("%H:%M"),
                    job.enabled
                );
            }
        }
        self.notify.notify_one();
    }

    /// The timing loop. Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Scheduler started");
        loop {
            let now = Local::now();
            let planned: Vec<(JobKind, DateTime<Local>)> = self
                .jobs()
                .iter()
                .filter_map(|j| j.next_fire(now).map(|at| (j.kind, at)))
                .collect();

            let sleep_for = planned
                .iter()
                .map(|(_, at)| (*at - now).to_std().unwrap_or(Duration::ZERO))
                .min()
                .unwrap_or(IDLE_REARM);

            tokio::select! {
                _ = cancel.cancelled() => break,
                // Job set changed; recompute the plan
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            let now = Local::now();
            for (kind, at) in planned {
                if at <= now {
                    self.trigger_now(kind).await;
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// Execute one job immediately and record the outcome on the job.
    /// Also the backing for the operator's "run now" request.
    pub async fn trigger_now(&self, kind: JobKind) -> JobResult {
        tracing::info!("Job {} firing", kind);
        let result = match kind {
            JobKind::Restart => self.run_restart().await,
            JobKind::Backup => self.run_backup().await,
        };
        let now = Local::now();
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.iter_mut().find(|j| j.kind == kind) {
                job.last_run = Some(now);
                job.last_result = Some(result);
            }
        }
        result
    }

    async fn run_restart(&self) -> JobResult {
        match self.supervisor.current_state() {
            LifecycleState::Running => {
                self.announce("Scheduled restart: stopping server");
                if let Err(e) = self.supervisor.stop(None).await {
                    tracing::error!("Scheduled restart failed to stop: {}", e);
                    return JobResult::Failed;
                }
                match self.supervisor.start().await {
                    Ok(()) => {
                        self.announce("Scheduled restart complete");
                        JobResult::Ok
                    }
                    Err(e) => {
                        tracing::error!("Scheduled restart failed to start: {}", e);
                        self.announce(&format!("Scheduled restart failed: {}", e));
                        JobResult::Failed
                    }
                }
            }
            LifecycleState::Stopped if self.restart_when_stopped => {
                self.announce("Scheduled restart: starting stopped server");
                match self.supervisor.start().await {
                    Ok(()) => JobResult::Ok,
                    Err(e) => {
                        tracing::error!("Scheduled restart failed to start: {}", e);
                        JobResult::Failed
                    }
                }
            }
            LifecycleState::Stopped => {
                // The operator stopped the server on purpose; leave it be.
                tracing::info!("Scheduled restart skipped: server is stopped");
                JobResult::Skipped
            }
            other => {
                tracing::warn!("Scheduled restart skipped in state {}", other);
                JobResult::Skipped
            }
        }
    }

    async fn run_backup(&self) -> JobResult {
        match self.backups.snapshot().await {
            Ok(record) => {
                tracing::info!("Scheduled backup created {}", record.id);
                JobResult::Ok
            }
            Err(e) => {
                tracing::error!("Scheduled backup failed: {}", e);
                JobResult::Failed
            }
        }
    }

    fn announce(&self, msg: &str) {
        self.supervisor
            .console_bus()
            .append(LineSource::System, msg.to_string(), LogLevel::Info);
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────
