//! omega-collector: receives the metric streams of a group's agents.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{info, warn};

use omega::bootstrap::{
    bind_addr, connect_registry, handle_maintenance, init_dirs, load_config, register_service, wait_for_termination,
    ConfigSource, Maintenance,
};
use omega::config::{resolve_from, root_dir};
use omega::logging::init_logging;
use omega::pidfile::PidLock;
use omega::server::{CollectorService, RpcServer};
use omega::{OMEGA_VERSION, SERVICE_COLLECTOR};

/// omega-collector CLI
#[derive(Parser, Debug)]
#[command(name = "omega-collector", version, about = "omega-collector is a Collector Server")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "omega-collector.toml", env = "OMEGA_COLLECTOR_CONFIG")]
    config: PathBuf,

    /// Pid file path
    #[arg(short, long, default_value = "../var/run/omega-collector.pid")]
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
        handle_maintenance(command, "omega-collector", &root, Some(&cli.config), "-collector")?;
        return Ok(());
    }

    init_dirs(&root, &["../var/run", "../log"]).context("Init folder failure")?;
    let (mut config, source) =
        load_config(&root, Some(&cli.config), "-collector").context("Setup config failure")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    let log_dir = resolve_from(&root, &config.log.dir);
    let _log_guard = init_logging(&config.log, Some(&log_dir), "collector.log").context("Setup log failure")?;

    info!(version = OMEGA_VERSION, "omega-collector starting");
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Configuration loaded"),
        ConfigSource::Defaults(e) => warn!(error = %e, "Config file not found, using defaults"),
    }

    let registry = connect_registry(&config).await.context("Register etcd failure")?;

    let addr = bind_addr(&config, config.collector.grpc_server_port)?;
    let service = Arc::new(CollectorService::new());
    let server = RpcServer::bind(&addr, service.clone())
        .await
        .context("Startup server failure")?;
    let registration = register_service(&registry, &config, SERVICE_COLLECTOR, server.port())
        .await
        .context("Register service failure")?;

    let pid_file = resolve_from(&root, &cli.pid);
    let pid_lock = PidLock::acquire(&pid_file)
        .with_context(|| format!("Create pid-file[{}] failure", pid_file.display()))?;

    wait_for_termination().await.context("Install signal handler failure")?;

    if let Err(e) = pid_lock.release() {
        warn!(error = %e, "Release pid file failure");
    }
    registration.revoke().await;
    server.shutdown().await;
    info!(received = service.received(), "omega-collector stopped");
    Ok(())
}
