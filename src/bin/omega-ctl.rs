//! omega-ctl: command line control of watchdogs, agents and the registry.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};

use omega::bootstrap::{connect_registry, load_config};
use omega::client::{AgentClient, WatchdogClient};
use omega::config::{root_dir, LogConfig};
use omega::logging::init_logging;
use omega::wire::ControlSignal;

const MIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// omega-ctl CLI
#[derive(Parser, Debug)]
#[command(name = "omega-ctl", version, about = "omega-ctl is a command line tool for omega")]
struct Cli {
    /// Request timeout, "10s" or plain seconds; clamped to 5s..60s
    #[arg(short, long, default_value = "10s", value_parser = parse_timeout, global = true)]
    timeout: Duration,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Control an omega-watchdog
    Watchdog {
        #[command(subcommand)]
        action: WatchdogAction,
    },
    /// Query an omega agent
    Omega {
        #[command(subcommand)]
        action: OmegaAction,
    },
    /// Inspect the service registry
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand, Debug)]
enum WatchdogAction {
    /// Send a control signal
    Notify {
        #[arg(short, long, value_enum)]
        sig: Signal,
        #[arg(short, long, default_value = "127.0.0.1:28500")]
        addr: String,
    },
    /// Show the supervised process state
    Status {
        #[arg(short, long, default_value = "127.0.0.1:28500")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum OmegaAction {
    Ping {
        #[arg(short, long, default_value = "127.0.0.1:28501")]
        addr: String,
    },
    Version {
        #[arg(short, long, default_value = "127.0.0.1:28501")]
        addr: String,
    },
    System {
        #[arg(short, long, default_value = "127.0.0.1:28501")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceAction {
    /// List every registered service
    List {
        /// Configuration file holding the registry endpoints
        #[arg(short, long, default_value = "omega-ctl.toml")]
        config: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Signal {
    Up,
    Quit,
}

impl From<Signal> for ControlSignal {
    fn from(sig: Signal) -> Self {
        match sig {
            Signal::Up => ControlSignal::Up,
            Signal::Quit => ControlSignal::Quit,
        }
    }
}

fn parse_timeout(s: &str) -> Result<Duration, String> {
    let timeout = match s.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(s).map_err(|e| e.to_string())?,
    };
    Ok(timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT))
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let log = LogConfig {
        level: "warn".to_string(),
        ..LogConfig::default()
    };
    let _log_guard = init_logging(&log, None, "ctl.log").context("Setup log failure")?;

    match cli.command {
        Command::Watchdog { action } => watchdog(action, cli.timeout).await,
        Command::Omega { action } => omega(action, cli.timeout).await,
        Command::Service { action } => service(action).await,
    }
}

async fn watchdog(action: WatchdogAction, timeout: Duration) -> AnyhowResult<()> {
    match action {
        WatchdogAction::Notify { sig, addr } => {
            let mut client = WatchdogClient::connect(&addr, timeout).await?;
            let pid = client
                .notify(sig.into())
                .await
                .with_context(|| format!("notify {:?} to {}", sig, addr))?;
            println!("pid: {}", pid);
        }
        WatchdogAction::Status { addr } => {
            let mut client = WatchdogClient::connect(&addr, timeout).await?;
            println!("{:?}", client.status().await?);
        }
    }
    Ok(())
}

async fn omega(action: OmegaAction, timeout: Duration) -> AnyhowResult<()> {
    match action {
        OmegaAction::Ping { addr } => {
            let mut client = AgentClient::connect(&addr, timeout).await?;
            println!("{}", client.ping().await?);
        }
        OmegaAction::Version { addr } => {
            let mut client = AgentClient::connect(&addr, timeout).await?;
            println!("{}", client.version().await?);
        }
        OmegaAction::System { addr } => {
            let mut client = AgentClient::connect(&addr, timeout).await?;
            let info = client.system().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}

async fn service(action: ServiceAction) -> AnyhowResult<()> {
    match action {
        ServiceAction::List { config } => {
            let (config, _) = load_config(&root_dir(), Some(&config), "-ctl")?;
            let registry = connect_registry(&config).await?;
            let prefix = format!("/{}", config.global.key_prefix);
            let records = registry.store().get_prefix(&prefix).await?;

            println!("{:<4} {:<20} {:<64} {}", "no", "service", "key", "value");
            for (no, (key, value)) in records.iter().enumerate() {
                let service = key
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.trim_start_matches('/').split('/').next())
                    .unwrap_or("-");
                println!("{:<4} {:<20} {:<64} {}", no + 1, service, key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_clamps() {
        assert_eq!(parse_timeout("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_timeout("1s").unwrap(), MIN_TIMEOUT);
        assert_eq!(parse_timeout("5m").unwrap(), MAX_TIMEOUT);
        assert_eq!(parse_timeout("30s").unwrap(), Duration::from_secs(30));
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn test_cli_parses_notify() {
        let cli = Cli::try_parse_from(["omega-ctl", "watchdog", "notify", "--sig", "up"]).unwrap();
        match cli.command {
            Command::Watchdog {
                action: WatchdogAction::Notify { sig, addr },
            } => {
                assert!(matches!(ControlSignal::from(sig), ControlSignal::Up));
                assert_eq!(addr, "127.0.0.1:28500");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
