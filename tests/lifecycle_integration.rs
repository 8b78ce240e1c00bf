//! End-to-end lifecycle scenarios against a fake shell "server".
//!
//! The fake server prints a ready line, echoes stdin, and exits when it
//! reads the stop command - enough to drive the supervisor, the backup
//! engine and the scheduler through their full coordination paths.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use craftd::backup::{BackupEngine, BackupStatus};
use craftd::config::SchedulerConfig;
use craftd::console::{ConsoleBus, LineSource};
use craftd::instance::ServerInstance;
use craftd::scheduler::{JobKind, JobResult, Scheduler};
use craftd::supervisor::error::SupervisorError;
use craftd::supervisor::state_machine::LifecycleState;
use craftd::supervisor::{Supervisor, SupervisorOptions};

const WELL_BEHAVED: &str =
    "echo READY; while read line; do [ \"$line\" = stop ] && exit 0; echo \"$line\"; done";

struct Harness {
    supervisor: Arc<Supervisor>,
    backups: Arc<BackupEngine>,
    instance: Arc<ServerInstance>,
}

fn harness(dir: &Path, script: &str) -> Harness {
    let mut instance = ServerInstance::new("itest", dir);
    instance.java_bin = "sh".to_string();
    // The trailing "-jar server.jar nogui" launch args land in $0..$2 of
    // the -c script and are ignored.
    instance.jvm_args = vec!["-c".to_string(), script.to_string()];
    std::fs::write(instance.jar_path(), b"fake jar").unwrap();
    instance.write_eula(true).unwrap();

    let world = instance.world_path();
    std::fs::create_dir_all(world.join("region")).unwrap();
    std::fs::write(world.join("level.dat"), b"original level").unwrap();
    std::fs::write(world.join("region/r.0.0.mca"), vec![3u8; 1024]).unwrap();

    let instance = Arc::new(instance);
    let bus = Arc::new(ConsoleBus::default());
    let supervisor = Supervisor::new(
        instance.clone(),
        bus,
        SupervisorOptions {
            ready_pattern: "READY".to_string(),
            stop_command: "stop".to_string(),
            start_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        },
    );
    let backups = Arc::new(BackupEngine::new(instance.clone(), supervisor.clone()));
    Harness {
        supervisor,
        backups,
        instance,
    }
}

fn lifecycle_lines(supervisor: &Supervisor) -> Vec<String> {
    supervisor
        .console_recent(10_000)
        .into_iter()
        .filter(|l| l.source == LineSource::System && l.text.starts_with("Lifecycle:"))
        .map(|l| l.text)
        .collect()
}

async fn wait_for_state(supervisor: &Supervisor, want: LifecycleState, secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while supervisor.current_state() != want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "state never became {} (is {})",
            want,
            supervisor.current_state()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn snapshot_of_running_server_quiesces_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), WELL_BEHAVED);

    h.supervisor.start().await.unwrap();
    assert_eq!(h.supervisor.current_state(), LifecycleState::Running);

    let record = h.backups.snapshot().await.unwrap();
    assert_eq!(record.status, BackupStatus::Complete);
    assert_eq!(record.file_count, 2);

    // The server is running again after the snapshot
    assert_eq!(h.supervisor.current_state(), LifecycleState::Running);

    // Full state sequence observable through the console stream alone:
    // initial start, then the quiesce/resume around the copy
    assert_eq!(
        lifecycle_lines(&h.supervisor),
        vec![
            "Lifecycle: stopped -> starting",
            "Lifecycle: starting -> running",
            "Lifecycle: running -> stopping",
            "Lifecycle: stopping -> stopped",
            "Lifecycle: stopped -> starting",
            "Lifecycle: starting -> running",
        ]
    );

    h.supervisor.stop(None).await.unwrap();
}

#[tokio::test]
async fn restore_refused_while_running_and_world_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), WELL_BEHAVED);

    // Snapshot while stopped, so there is something to restore
    let record = h.backups.snapshot().await.unwrap();

    h.supervisor.start().await.unwrap();
    let before = std::fs::read(h.instance.world_path().join("level.dat")).unwrap();

    let err = h.backups.restore(&record.id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ServerRunning(LifecycleState::Running)));

    // World data is exactly as it was
    let after = std::fs::read(h.instance.world_path().join("level.dat")).unwrap();
    assert_eq!(before, after);

    h.supervisor.stop(None).await.unwrap();

    // Once stopped, the same restore goes through
    h.backups.restore(&record.id).await.unwrap();
}

#[tokio::test]
async fn externally_killed_process_becomes_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), WELL_BEHAVED);

    h.supervisor.start().await.unwrap();
    let pid = h.supervisor.status().pid.expect("running server has a PID");

    // Kill the server behind the supervisor's back
    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    wait_for_state(&h.supervisor, LifecycleState::Crashed, 10).await;

    // Crashed, never Stopped: a stop() now is a protocol error
    assert!(matches!(
        h.supervisor.stop(None).await,
        Err(SupervisorError::NotRunning(LifecycleState::Crashed))
    ));

    // Acknowledge and bring it back
    h.supervisor.acknowledge().await.unwrap();
    h.supervisor.start().await.unwrap();
    assert_eq!(h.supervisor.current_state(), LifecycleState::Running);
    h.supervisor.stop(None).await.unwrap();
}

#[tokio::test]
async fn scheduled_restart_bounces_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), WELL_BEHAVED);
    let scheduler = Scheduler::new(
        h.supervisor.clone(),
        h.backups.clone(),
        &SchedulerConfig::default(),
    )
    .unwrap();

    h.supervisor.start().await.unwrap();
    let first_pid = h.supervisor.status().pid.unwrap();

    assert_eq!(scheduler.trigger_now(JobKind::Restart).await, JobResult::Ok);
    assert_eq!(h.supervisor.current_state(), LifecycleState::Running);
    let second_pid = h.supervisor.status().pid.unwrap();
    assert_ne!(first_pid, second_pid, "restart must produce a fresh process");

    h.supervisor.stop(None).await.unwrap();
}

#[tokio::test]
async fn scheduled_backup_job_round_trips_through_running_server() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), WELL_BEHAVED);
    let scheduler = Scheduler::new(
        h.supervisor.clone(),
        h.backups.clone(),
        &SchedulerConfig::default(),
    )
    .unwrap();

    h.supervisor.start().await.unwrap();

    assert_eq!(scheduler.trigger_now(JobKind::Backup).await, JobResult::Ok);
    assert_eq!(h.supervisor.current_state(), LifecycleState::Running);
    assert_eq!(h.backups.list().unwrap().len(), 1);

    let job = scheduler
        .jobs()
        .into_iter()
        .find(|j| j.kind == JobKind::Backup)
        .unwrap();
    assert_eq!(job.last_result, Some(JobResult::Ok));
    assert!(job.last_run.is_some());

    h.supervisor.stop(None).await.unwrap();
}
