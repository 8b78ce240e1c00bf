use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use craftd::backup::BackupEngine;
use craftd::config::GlobalConfig;
use craftd::console::ConsoleBus;
use craftd::instance::ServerInstance;
use craftd::ipc::{AppState, IpcServer};
use craftd::scheduler::Scheduler;
use craftd::supervisor::{Supervisor, SupervisorOptions};

/// How often the monitor loop cross-checks the tracked PID against the
/// OS process table.
const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    tracing::info!("craftd starting");

    let cfg = GlobalConfig::load()?;

    let mut instance = ServerInstance::new(&cfg.server.name, &cfg.server.dir);
    instance.java_bin = cfg.server.java_bin.clone();
    instance.jvm_args = cfg.server.jvm_args.clone();
    instance.jar_name = cfg.server.jar_name.clone();
    instance.world_dir_name = cfg.server.world_dir.clone();
    let instance = Arc::new(instance);
    tracing::info!(
        "Managing server '{}' at {}",
        instance.name,
        instance.root_dir.display()
    );

    let bus = Arc::new(ConsoleBus::new(
        cfg.console.buffer_size,
        Some(&cfg.server.level_pattern),
    ));
    let supervisor = Supervisor::new(
        instance.clone(),
        bus,
        SupervisorOptions {
            ready_pattern: cfg.server.ready_pattern.clone(),
            stop_command: cfg.server.stop_command.clone(),
            start_timeout: Duration::from_secs(cfg.server.start_timeout_secs),
            stop_grace: Duration::from_secs(cfg.server.stop_grace_secs),
        },
    );
    let backups = Arc::new(BackupEngine::new(instance.clone(), supervisor.clone()));
    let scheduler = Scheduler::new(supervisor.clone(), backups.clone(), &cfg.scheduler)?;

    let shutdown = CancellationToken::new();

    // Scheduler timing loop
    {
        let scheduler = scheduler.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            scheduler.run(cancel).await;
        });
    }

    // Process-table cross-check loop
    {
        let supervisor = supervisor.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                }
                supervisor.monitor_tick().await;
            }
        });
    }

    // Graceful shutdown on Ctrl+C / SIGTERM: cancel the loops, then try
    // to bring a running server down cleanly before exiting.
    {
        let supervisor = supervisor.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received, stopping server...");
            cancel.cancel();
            supervisor.shutdown().await;
            tracing::info!("Cleanup complete, exiting");
            std::process::exit(0);
        });
    }

    let ipc = IpcServer::new(
        AppState {
            supervisor,
            backups,
            scheduler,
            instance,
        },
        &cfg.listen_addr.0,
    );
    if let Err(e) = ipc.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("craftd shutting down");
    Ok(())
}
