//! omega: the host agent.
//!
//! Gathers metrics from the built-in plugins, streams them to the group's
//! collectors and answers Ping/Version/System requests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use omega::agent::Agent;
use omega::bootstrap::{
    bind_addr, connect_registry, handle_maintenance, init_dirs, load_config, register_service, report_fatal,
    wait_for_termination, ConfigSource, Maintenance,
};
use omega::config::{resolve_from, root_dir};
use omega::logging::init_logging;
use omega::pidfile::PidLock;
use omega::plugins::PluginRegistry;
use omega::server::{AgentService, RpcServer};
use omega::{OMEGA_VERSION, SERVICE_AGENT};

/// omega CLI
#[derive(Parser, Debug)]
#[command(name = "omega", version, about = "omega is a Host Monitoring Service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "omega.toml", env = "OMEGA_CONFIG")]
    config: PathBuf,

    /// Pid file path; the watchdog probes it to adopt a running agent
    #[arg(short, long, default_value = "../var/run/omega.pid")]
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
        handle_maintenance(command, "omega", &root, Some(&cli.config), "")?;
        return Ok(());
    }

    init_dirs(&root, &["../var/run", "../log"]).context("Init folder failure")?;
    let (mut config, source) = load_config(&root, Some(&cli.config), "").context("Setup config failure")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    let log_dir = resolve_from(&root, &config.log.dir);
    let log_guard = init_logging(&config.log, Some(&log_dir), "agent.log").context("Setup log failure")?;

    info!(version = OMEGA_VERSION, "omega starting");
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Configuration loaded"),
        ConfigSource::Defaults(e) => warn!(error = %e, "Config file not found, using defaults"),
    }

    let registry = connect_registry(&config).await.context("Register etcd failure")?;

    let cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = oneshot::channel();
    let agent = Agent::new(&config, PluginRegistry::with_builtin(), Some(registry.clone()));
    let mut running = tokio::spawn(agent.run(cancel.clone(), Some(ready_tx)));

    // The agent fails fast (no collector, bad plugin table) before ready.
    if ready_rx.await.is_err() {
        if let Err(e) = (&mut running).await.context("Agent task failure")? {
            let code = report_fatal("Run agent failure", &e);
            drop(log_guard);
            std::process::exit(code);
        }
        anyhow::bail!("agent stopped before it was ready");
    }

    let addr = bind_addr(&config, config.agent.grpc_server_port)?;
    let server = RpcServer::bind(&addr, Arc::new(AgentService::new()))
        .await
        .context("Startup server failure")?;
    let registration = register_service(&registry, &config, SERVICE_AGENT, server.port())
        .await
        .context("Register service failure")?;

    let pid_file = resolve_from(&root, &cli.pid);
    let pid_lock = PidLock::acquire(&pid_file)
        .with_context(|| format!("Create pid-file[{}] failure", pid_file.display()))?;

    let finished = tokio::select! {
        signal = wait_for_termination() => {
            signal.context("Install signal handler failure")?;
            None
        }
        joined = &mut running => Some(joined),
    };

    if let Err(e) = pid_lock.release() {
        warn!(error = %e, "Release pid file failure");
    }
    registration.revoke().await;
    server.shutdown().await;
    cancel.cancel();
    let outcome = match finished {
        Some(joined) => joined,
        None => running.await,
    };

    if let Err(e) = outcome.context("Agent task failure")? {
        let code = report_fatal("Run agent failure", &e);
        drop(log_guard);
        std::process::exit(code);
    }
    info!("omega stopped");
    Ok(())
}
