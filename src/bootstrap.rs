// ============================================================================
// SECTION 17: PROCESS BOOTSTRAP
// ============================================================================
// Startup and shutdown steps shared by the omega binaries: runtime
// directories, config discovery, service registration and termination
// signals.
// ============================================================================

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::config::{find_path, resolve_from, OmegaConfig};
use crate::error::{ConfigError, OmegaError, OmegaResult, RecoveryHint};
use crate::registry::{connect_store, Registration, Registry};
use crate::server::advertised_ips;
use crate::{service_key, OMEGA_VERSION};

/// Create each directory under `root`; a plain file in the way is an error.
pub fn init_dirs(root: &Path, dirs: &[&str]) -> io::Result<()> {
    for dir in dirs {
        let path = resolve_from(root, dir);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("exist same name file: {}", path.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(&path)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Outcome of config discovery.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No candidate existed; built-in defaults are in use
    Defaults(ConfigError),
}

/// Find and load `omega<suffix>.toml`, falling back to defaults when no
/// file exists. A file that exists but does not parse is an error.
pub fn load_config(root: &Path, explicit: Option<&Path>, suffix: &str) -> OmegaResult<(OmegaConfig, ConfigSource)> {
    let explicit = explicit.map(|p| resolve_from(root, p));
    match find_path(root, explicit.as_deref(), suffix) {
        Ok(path) => {
            let config = OmegaConfig::load(&path)?;
            Ok((config, ConfigSource::File(path)))
        }
        Err(e @ ConfigError::NoCandidate { .. }) => Ok((OmegaConfig::default(), ConfigSource::Defaults(e))),
        Err(e) => Err(e.into()),
    }
}

/// Registry over the configured endpoints.
pub async fn connect_registry(config: &OmegaConfig) -> OmegaResult<Registry> {
    let store = connect_store(&config.global.etcd_endpoints).await?;
    Ok(Registry::new(store))
}

/// Publish `service` of this host's group on `port`.
pub async fn register_service(
    registry: &Registry,
    config: &OmegaConfig,
    service: &str,
    port: u16,
) -> OmegaResult<Registration> {
    let (inner, outer) = advertised_ips(config.inner_ip(), config.outer_ip())?;
    let key = service_key(&config.global.key_prefix, service, &config.global.group_name);
    let registration = registry
        .register(
            &key,
            &inner,
            &outer,
            port,
            &config.global.etcd_endpoints,
            config.global.lease_ttl_secs,
        )
        .await?;
    Ok(registration)
}

/// Address to bind a server of this host on.
pub fn bind_addr(config: &OmegaConfig, port: u16) -> OmegaResult<String> {
    let (inner, _) = advertised_ips(config.inner_ip(), config.outer_ip())?;
    Ok(format!("{}:{}", inner, port))
}

/// Block until SIGINT, SIGTERM or SIGQUIT; returns the signal name.
pub async fn wait_for_termination() -> io::Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    info!(target: "omega::bootstrap", signal = name, "Received termination signal");
    Ok(name)
}

// ----------------------------------------------------------------------------
// 17.1 Maintenance Subcommands
// ----------------------------------------------------------------------------

/// Subcommands every server binary accepts instead of running.
#[derive(Subcommand, Debug, Clone)]
pub enum Maintenance {
    /// Show version and build info
    Version,

    /// Print the default configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate {
        /// Show the full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Run a maintenance subcommand for `binary`.
pub fn handle_maintenance(
    command: &Maintenance,
    binary: &str,
    root: &Path,
    config: Option<&Path>,
    suffix: &str,
) -> OmegaResult<()> {
    match command {
        Maintenance::Version => {
            println!("{} v{}", binary, OMEGA_VERSION);
            println!("  • Target: {}", std::env::consts::ARCH);
            println!("  • OS: {}", std::env::consts::OS);
            println!("  • Registry backend: {}", if cfg!(feature = "etcd") { "etcd" } else { "memory" });
        }
        Maintenance::GenerateConfig { output } => {
            let text = OmegaConfig::generate_default_config();
            match output {
                Some(path) => {
                    fs::write(path, &text)?;
                    println!("Default configuration written to: {}", path.display());
                }
                None => println!("{}", text),
            }
        }
        Maintenance::Validate { verbose } => {
            let (config, source) = load_config(root, config, suffix)?;
            match &source {
                ConfigSource::File(path) => println!("Configuration is valid: {}", path.display()),
                ConfigSource::Defaults(e) => println!("{}; built-in defaults are valid", e),
            }
            if *verbose {
                match toml::to_string_pretty(&config) {
                    Ok(text) => println!("{}", text),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }
            println!("  • Group: {}", config.global.group_name);
            println!("  • Registry endpoints: {}", config.global.etcd_endpoints.join(", "));
            println!("  • Gather period: {:?}", config.agent.period);
            println!("  • Plugin tables: {}", config.plugins.len());
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 17.2 Failure Reporting
// ----------------------------------------------------------------------------

/// sysexits(3) codes the binaries exit with.
pub const EXIT_SOFTWARE: i32 = 70;
pub const EXIT_TEMPFAIL: i32 = 75;
pub const EXIT_CONFIG: i32 = 78;

/// Log a fatal error with its category and recovery hint and return the
/// process exit code. A supervisor that sees a temporary failure may
/// restart the binary; a configuration failure needs an operator.
pub fn report_fatal(context: &str, err: &OmegaError) -> i32 {
    let hint = err.recovery_hint();
    error!(
        target: "omega::bootstrap",
        category = err.category(),
        recoverable = err.is_recoverable(),
        hint = ?hint,
        error = %err,
        "{}",
        context
    );
    match hint {
        RecoveryHint::FixConfiguration => EXIT_CONFIG,
        _ if err.is_recoverable() => EXIT_TEMPFAIL,
        _ => EXIT_SOFTWARE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_init_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bin");
        fs::create_dir_all(&root).unwrap();

        init_dirs(&root, &["../var/run", "../log"]).unwrap();
        assert!(dir.path().join("var/run").is_dir());
        assert!(dir.path().join("log").is_dir());

        // Idempotent.
        init_dirs(&root, &["../log"]).unwrap();

        fs::write(dir.path().join("cache"), "x").unwrap();
        let err = init_dirs(&root, &["../cache"]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_load_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = load_config(dir.path(), Some(Path::new("missing.toml")), "-test-none").unwrap();
        assert!(matches!(source, ConfigSource::Defaults(_)));
        assert_eq!(config.global.group_name, OmegaConfig::default().global.group_name);
    }

    #[test]
    fn test_load_config_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("custom.toml"),
            "[global]\ngroup_name = \"edge\"\n",
        )
        .unwrap();

        let (config, source) = load_config(dir.path(), Some(Path::new("custom.toml")), "").unwrap();
        assert!(matches!(source, ConfigSource::File(_)));
        assert_eq!(config.global.group_name, "edge");
    }

    #[test]
    fn test_load_config_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.toml"), "[global\n").unwrap();
        assert!(load_config(dir.path(), Some(Path::new("broken.toml")), "").is_err());
    }

    #[test]
    fn test_report_fatal_exit_codes() {
        let config: OmegaError = ConfigError::invalid_value("agent.period", "must be > 0").into();
        assert_eq!(report_fatal("Setup config failure", &config), EXIT_CONFIG);

        let no_collector: OmegaError = crate::error::OutputError::NoCollector {
            service: "grpclb/service/omega-collector/omega-default".to_string(),
        }
        .into();
        assert_eq!(report_fatal("Run agent failure", &no_collector), EXIT_TEMPFAIL);

        let load_child: OmegaError = crate::error::SupervisorError::LoadChild {
            path: PathBuf::from("../var/run/omega.pid"),
            message: "invalid digit".to_string(),
        }
        .into();
        assert_eq!(report_fatal("Run omega-watchdog failure", &load_child), EXIT_SOFTWARE);
    }

    #[tokio::test]
    async fn test_register_service_uses_group_key() {
        let mut config = OmegaConfig::default();
        config.grpc_server_host.insert(
            "inner_ip".to_string(),
            crate::config::AddrConfig { ip: "10.1.2.3".to_string() },
        );
        let registry = Registry::new(Arc::new(crate::registry::MemoryLeaseStore::new()));

        let registration = register_service(&registry, &config, crate::SERVICE_COLLECTOR, 30123)
            .await
            .unwrap();
        assert_eq!(
            registration.key(),
            "/grpclb/service/omega-collector/omega-default/10.1.2.3:30123"
        );
        assert_eq!(registration.value(), "10.1.2.3:30123");

        let key = service_key(&config.global.key_prefix, crate::SERVICE_COLLECTOR, &config.global.group_name);
        assert_eq!(registry.resolve(&key).await.unwrap(), vec!["10.1.2.3:30123".to_string()]);
        registration.revoke().await;
    }
}
