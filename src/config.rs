// ============================================================================
// SECTION 3: CONFIGURATION SYSTEM
// ============================================================================
// One TOML document shared by every omega binary:
// - TOML file parsing
// - Environment variable overrides (OMEGA_SECTION__KEY)
// - Validation
// - Sensible defaults
// - Config file discovery relative to the executable
// ============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ConfigError, ConfigResult};

// ----------------------------------------------------------------------------
// 3.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for all omega processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmegaConfig {
    /// Cluster-wide settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Addresses this host advertises, keyed by `inner_ip` / `outer_ip`
    #[serde(default)]
    pub grpc_server_host: HashMap<String, AddrConfig>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Watchdog (supervisor) settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Collector server settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Per-plugin configuration blobs, handed to plugins untouched
    #[serde(default = "default_plugins")]
    pub plugins: HashMap<String, serde_json::Value>,
}

impl Default for OmegaConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            grpc_server_host: HashMap::new(),
            log: LogConfig::default(),
            watchdog: WatchdogConfig::default(),
            agent: AgentConfig::default(),
            collector: CollectorConfig::default(),
            plugins: default_plugins(),
        }
    }
}

impl OmegaConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OMEGA_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: None,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.global.etcd_endpoints.is_empty() {
            return Err(ConfigError::invalid_value(
                "global.etcd_endpoints",
                "at least one endpoint is required",
            ));
        }
        if self.global.group_name.trim().is_empty() {
            return Err(ConfigError::invalid_value("global.group_name", "must not be empty"));
        }
        if self.global.lease_ttl_secs <= 0 {
            return Err(ConfigError::invalid_value("global.lease_ttl_secs", "must be positive"));
        }

        for (field, port) in [
            ("watchdog.grpc_server_port", self.watchdog.grpc_server_port),
            ("agent.grpc_server_port", self.agent.grpc_server_port),
            ("collector.grpc_server_port", self.collector.grpc_server_port),
        ] {
            if port == 0 {
                return Err(ConfigError::invalid_value(field, "port must be in 1..=65535"));
            }
        }

        if self.agent.period.is_zero() {
            return Err(ConfigError::invalid_value("agent.period", "must be greater than zero"));
        }
        if self.agent.buffer_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "agent.buffer_capacity",
                "must be greater than zero",
            ));
        }
        if self.watchdog.start_confirm.is_zero() || self.watchdog.quit_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "watchdog",
                "start_confirm and quit_timeout must be greater than zero",
            ));
        }

        for (key, value) in &self.plugins {
            if !value.is_object() {
                return Err(ConfigError::invalid_value(
                    format!("plugins.{}", key),
                    "plugin configuration must be a table",
                ));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Inner IP from `[grpc_server_host.inner_ip]`, if configured.
    pub fn inner_ip(&self) -> Option<&str> {
        self.grpc_server_host
            .get("inner_ip")
            .map(|a| a.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }

    /// Outer IP from `[grpc_server_host.outer_ip]`, if configured.
    pub fn outer_ip(&self) -> Option<&str> {
        self.grpc_server_host
            .get("outer_ip")
            .map(|a| a.ip.as_str())
            .filter(|ip| !ip.is_empty())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Global Configuration
// ----------------------------------------------------------------------------

/// Cluster-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Registry endpoints, probed in order
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: Vec<String>,

    /// Group the host belongs to; part of every registry key
    #[serde(default = "default_group_name")]
    pub group_name: String,

    /// Registry key prefix
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease TTL for registrations, in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: default_etcd_endpoints(),
            group_name: default_group_name(),
            key_prefix: default_key_prefix(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// An advertised address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddrConfig {
    #[serde(default)]
    pub ip: String,
}

// ----------------------------------------------------------------------------
// 3.3 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files, relative to the executable
    #[serde(default = "default_log_dir")]
    pub dir: String,

    /// Also log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Drop timestamps from log lines
    #[serde(default)]
    pub disable_timestamp: bool,

    /// Number of rotated child output files to keep
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            stdout: true,
            disable_timestamp: false,
            max_files: default_max_files(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Watchdog Configuration
// ----------------------------------------------------------------------------

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Control RPC port
    #[serde(default = "default_watchdog_port")]
    pub grpc_server_port: u16,

    /// Supervised binary
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Arguments passed to the supervised binary
    #[serde(default = "default_child_args")]
    pub args: Vec<String>,

    /// Pid file locked by a live child; probed for takeover at startup
    #[serde(default = "default_child_pid_file")]
    pub child_pid_file: String,

    /// How long a child must stay up to count as started
    #[serde(default = "default_confirm_window", with = "humantime_serde")]
    pub start_confirm: Duration,

    /// How long to wait for exit after SIGQUIT before killing
    #[serde(default = "default_confirm_window", with = "humantime_serde")]
    pub quit_timeout: Duration,

    /// Start the child immediately when no live child is found
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grpc_server_port: default_watchdog_port(),
            binary: default_binary(),
            args: default_child_args(),
            child_pid_file: default_child_pid_file(),
            start_confirm: default_confirm_window(),
            quit_timeout: default_confirm_window(),
            auto_start: true,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.5 Agent Configuration
// ----------------------------------------------------------------------------

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent RPC port
    #[serde(default = "default_agent_port")]
    pub grpc_server_port: u16,

    /// Gather period
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,

    /// Random delay added to each tick
    #[serde(default, with = "humantime_serde")]
    pub jitter: Duration,

    /// Fixed shift applied to aligned ticks
    #[serde(default, with = "humantime_serde")]
    pub offset: Duration,

    /// Capacity of the shared metric buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Collector addresses used when the registry has none
    #[serde(default)]
    pub collector_addrs: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            grpc_server_port: default_agent_port(),
            period: default_period(),
            jitter: Duration::ZERO,
            offset: Duration::ZERO,
            buffer_capacity: default_buffer_capacity(),
            collector_addrs: Vec::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Collector Configuration
// ----------------------------------------------------------------------------

/// Collector server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Push server port
    #[serde(default = "default_collector_port")]
    pub grpc_server_port: u16,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            grpc_server_port: default_collector_port(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.7 Default Value Functions
// ----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2379".to_string()]
}

fn default_group_name() -> String {
    "omega-default".to_string()
}

fn default_key_prefix() -> String {
    crate::ETCD_KEY_PREFIX.to_string()
}

fn default_lease_ttl() -> i64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

fn default_log_dir() -> String {
    "../log".to_string()
}

fn default_max_files() -> usize {
    10
}

fn default_watchdog_port() -> u16 {
    28500
}

fn default_agent_port() -> u16 {
    28501
}

fn default_collector_port() -> u16 {
    30123
}

fn default_binary() -> String {
    "../bin/omega".to_string()
}

fn default_child_pid_file() -> String {
    "../var/run/omega.pid".to_string()
}

fn default_child_args() -> Vec<String> {
    vec![
        "-c".to_string(),
        "omega.toml".to_string(),
        "-p".to_string(),
        default_child_pid_file(),
    ]
}

fn default_confirm_window() -> Duration {
    Duration::from_secs(2)
}

fn default_period() -> Duration {
    Duration::from_secs(60)
}

fn default_buffer_capacity() -> usize {
    crate::pipeline::DEFAULT_BUFFER_CAPACITY
}

fn default_plugins() -> HashMap<String, serde_json::Value> {
    let mut plugins = HashMap::new();
    plugins.insert(
        "cpu".to_string(),
        json!({
            "percpu": false,
            "totalcpu": true,
            "collect_cpu_time": false,
            "report_active": true,
        }),
    );
    plugins
}

// ----------------------------------------------------------------------------
// 3.8 Path Resolution
// ----------------------------------------------------------------------------

/// Directory holding the running executable; relative paths in the
/// configuration are resolved against it.
pub fn root_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve `path` against the executable directory unless it is absolute.
pub fn resolve(path: impl AsRef<Path>) -> PathBuf {
    resolve_from(&root_dir(), path)
}

pub fn resolve_from(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Locate a config file: the explicit path first, then
/// `../etc/omega<suffix>.toml`, `./etc/omega<suffix>.toml` and
/// `/etc/omega<suffix>.toml` relative to `base`.
pub fn find_path(base: &Path, explicit: Option<&Path>, suffix: &str) -> ConfigResult<PathBuf> {
    let file_name = format!("omega{}.toml", suffix);
    let mut candidates = Vec::with_capacity(4);
    if let Some(path) = explicit {
        if !path.as_os_str().is_empty() {
            candidates.push(path.to_path_buf());
        }
    }
    candidates.push(base.join("../etc").join(&file_name));
    candidates.push(base.join("./etc").join(&file_name));
    candidates.push(Path::new("/etc").join(&file_name));

    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.canonicalize().unwrap_or_else(|_| candidate.clone()));
        }
    }
    Err(ConfigError::NoCandidate { candidates })
}
