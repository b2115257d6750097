//! omega-watchdog: supervises the omega agent on one host.
//!
//! Serves the control RPC (`Notify` UP/QUIT, `Status`), registers itself in
//! the service registry and adopts an agent left running by a previous
//! watchdog.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use omega::bootstrap::{
    bind_addr, connect_registry, handle_maintenance, init_dirs, load_config, register_service, report_fatal,
    wait_for_termination, ConfigSource, Maintenance,
};
use omega::config::{resolve_from, root_dir};
use omega::logging::{init_logging, ChildLogSink};
use omega::pidfile::PidLock;
use omega::server::{RpcServer, WatchdogService};
use omega::supervisor::{CommandSpawner, Supervisor, SupervisorConfig};
use omega::{OMEGA_VERSION, SERVICE_WATCHDOG};

/// omega-watchdog CLI
#[derive(Parser, Debug)]
#[command(name = "omega-watchdog", version, about = "omega-watchdog is a watchdog service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "omega-watchdog.toml", env = "OMEGA_WATCHDOG_CONFIG")]
    config: PathBuf,

    /// Pid file path
    #[arg(short, long, default_value = "../var/run/omega-watchdog.pid")]
    pid: PathBuf,

    /// Log level override
    #[arg(short, long, env = "OMEGA_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Maintenance>,
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();
    let root = root_dir();

    if let Some(command) = &cli.command {
        handle_maintenance(command, "omega-watchdog", &root, Some(&cli.config), "")?;
        return Ok(());
    }

    init_dirs(&root, &["../var/run", "../log"]).context("Init folder failure")?;
    let (mut config, source) = load_config(&root, Some(&cli.config), "").context("Setup config failure")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    let log_dir = resolve_from(&root, &config.log.dir);
    let log_guard = init_logging(&config.log, Some(&log_dir), "watchdog.log").context("Setup log failure")?;

    info!(version = OMEGA_VERSION, "omega-watchdog starting");
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Configuration loaded"),
        ConfigSource::Defaults(e) => warn!(error = %e, "Config file not found, using defaults"),
    }

    let registry = connect_registry(&config).await.context("Register etcd failure")?;

    let child_pid_file = resolve_from(&root, &config.watchdog.child_pid_file);
    let spawner = CommandSpawner::new(
        resolve_from(&root, &config.watchdog.binary).to_string_lossy(),
        config.watchdog.args.clone(),
    )
    .with_current_dir(root.clone())
    .with_log_sink(ChildLogSink::new(&log_dir, "omega.out", config.log.max_files));
    let supervisor = Supervisor::new(
        SupervisorConfig::from_watchdog(&config.watchdog, Some(child_pid_file)),
        Arc::new(spawner),
    );

    let addr = bind_addr(&config, config.watchdog.grpc_server_port)?;
    let server = RpcServer::bind(&addr, Arc::new(WatchdogService::new(supervisor.clone())))
        .await
        .context("Startup server failure")?;
    let registration = register_service(&registry, &config, SERVICE_WATCHDOG, server.port())
        .await
        .context("Register service failure")?;

    let cancel = CancellationToken::new();
    let mut supervise = tokio::spawn(supervisor.clone().run(cancel.clone()));

    let pid_file = resolve_from(&root, &cli.pid);
    let pid_lock = PidLock::acquire(&pid_file)
        .with_context(|| format!("Create pid-file[{}] failure", pid_file.display()))?;

    let finished = tokio::select! {
        signal = wait_for_termination() => {
            signal.context("Install signal handler failure")?;
            None
        }
        joined = &mut supervise => Some(joined),
    };

    // Cleanup in reverse order of startup. A running child is left alive.
    if let Err(e) = pid_lock.release() {
        warn!(error = %e, "Release pid file failure");
    }
    cancel.cancel();
    let outcome = match finished {
        Some(joined) => joined,
        None => supervise.await,
    };
    registration.revoke().await;
    server.shutdown().await;

    match outcome {
        Ok(Ok(())) => {
            info!("omega-watchdog stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            let code = report_fatal("Run omega-watchdog failure", &e.into());
            drop(log_guard);
            std::process::exit(code)
        }
        Err(e) => Err(e).context("Supervisor task failure"),
    }
}
