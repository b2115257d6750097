// ============================================================================
// SECTION 2: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem, designed for:
// - Clear error categorization
// - Exact operator-facing messages for supervisor contention
// - Recovery strategy hints
// ============================================================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 2.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type for omega.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum OmegaError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl OmegaError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            OmegaError::Config(_) => false,
            OmegaError::Supervisor(e) => e.is_recoverable(),
            OmegaError::Registry(_) => true,
            OmegaError::Output(e) => e.is_recoverable(),
            OmegaError::Plugin(_) => true,
            OmegaError::Rpc(e) => e.is_recoverable(),
            OmegaError::Io(_) => true,
            OmegaError::Internal(_) => false,
            OmegaError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            OmegaError::Config(_) => "config",
            OmegaError::Supervisor(_) => "supervisor",
            OmegaError::Registry(_) => "registry",
            OmegaError::Output(_) => "output",
            OmegaError::Plugin(_) => "plugin",
            OmegaError::Rpc(_) => "rpc",
            OmegaError::Io(_) => "io",
            OmegaError::Internal(_) => "internal",
            OmegaError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            OmegaError::Config(_) => RecoveryHint::FixConfiguration,
            OmegaError::Supervisor(e) => e.recovery_hint(),
            OmegaError::Registry(_) => RecoveryHint::RetryWithBackoff,
            OmegaError::Output(e) => e.recovery_hint(),
            OmegaError::Rpc(e) => e.recovery_hint(),
            OmegaError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Report to the caller, who may try again later
    ReportToCaller,
    /// Retry with backoff
    RetryWithBackoff,
    /// Reconnect to the remote side
    Reconnect,
    /// Issue a new reload request
    Reload,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 2.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("No configuration file found, possible paths: {candidates:?}")]
    NoCandidate { candidates: Vec<PathBuf> },

    #[error("Failed to parse configuration: {message}")]
    ParseError {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
            source: None,
        }
    }
}

// ----------------------------------------------------------------------------
// 2.3 Supervisor Errors
// ----------------------------------------------------------------------------

/// Errors produced by the watchdog supervisor and its `Notify` gate.
///
/// The first three variants are contention errors and carry the exact
/// strings operators see through the control RPC.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("watchdog service is busy")]
    Busy,

    #[error("omega is stopped")]
    AlreadyStopped,

    #[error("omega is running")]
    AlreadyRunning,

    #[error("spawn '{program}' failure, nest error: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process {pid} exited during startup: {status}")]
    ExitedDuringStartup { pid: u32, status: String },

    #[error("process {pid} did not exit within {timeout_ms}ms after SIGQUIT")]
    QuitTimeout { pid: u32, timeout_ms: u64 },

    #[error("process {pid} exited abnormally: {status}")]
    UnexpectedExit { pid: u32, status: String },

    #[error("load child process from '{path}' failure: {message}")]
    LoadChild { path: PathBuf, message: String },

    #[error("supervisor is shut down")]
    Closed,
}

impl SupervisorError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SupervisorError::LoadChild { .. } | SupervisorError::Closed)
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            SupervisorError::Busy
            | SupervisorError::AlreadyStopped
            | SupervisorError::AlreadyRunning => RecoveryHint::ReportToCaller,
            SupervisorError::SpawnFailed { .. } => RecoveryHint::AlertOperator,
            SupervisorError::ExitedDuringStartup { .. } | SupervisorError::UnexpectedExit { .. } => {
                RecoveryHint::Reload
            }
            SupervisorError::QuitTimeout { .. } => RecoveryHint::ReportToCaller,
            SupervisorError::LoadChild { .. } | SupervisorError::Closed => RecoveryHint::None,
        }
    }

    /// Contention errors are answered without touching the child.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            SupervisorError::Busy | SupervisorError::AlreadyStopped | SupervisorError::AlreadyRunning
        )
    }
}

// ----------------------------------------------------------------------------
// 2.4 Registry Errors
// ----------------------------------------------------------------------------

/// Errors from the lease-backed service registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no registry endpoint configured")]
    NoEndpoints,

    #[error("registry endpoint '{endpoint}' unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("lease {lease} not found")]
    LeaseNotFound { lease: i64 },

    #[error("timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("registry backend error: {message}")]
    Backend { message: String },
}

impl RegistryError {
    pub fn backend(message: impl Into<String>) -> Self {
        RegistryError::Backend {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.5 Output Errors
// ----------------------------------------------------------------------------

/// Errors related to metric outputs
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Output '{name}' connect to '{target}' failed: {message}")]
    ConnectFailed {
        name: String,
        target: String,
        message: String,
    },

    #[error("No collector address available for '{service}'")]
    NoCollector { service: String },

    #[error("Output '{name}' send failed: {message}")]
    SendFailed { name: String, message: String },

    #[error("Output '{name}' is not connected")]
    NotConnected { name: String },

    #[error("Output pool already started")]
    AlreadyStarted,
}

impl OutputError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, OutputError::AlreadyStarted)
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            OutputError::ConnectFailed { .. } | OutputError::NoCollector { .. } => {
                RecoveryHint::RetryWithBackoff
            }
            OutputError::SendFailed { .. } | OutputError::NotConnected { .. } => {
                RecoveryHint::Reconnect
            }
            OutputError::AlreadyStarted => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 2.6 Plugin Errors
// ----------------------------------------------------------------------------

/// Errors from metric-gathering plugins
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("read '{path}' failure: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse '{path}' failure: {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("invalid config for plugin '{plugin}': {message}")]
    InvalidConfig { plugin: String, message: String },
}

// ----------------------------------------------------------------------------
// 2.7 RPC Errors
// ----------------------------------------------------------------------------

/// Errors from the framed TCP control protocol
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("bind '{addr}' failure: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to '{addr}' failure: {message}")]
    Connect { addr: String, message: String },

    #[error("timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{message}")]
    Remote { message: String },

    #[error("unexpected response, expected {expected}")]
    UnexpectedResponse { expected: &'static str },
}

impl RpcError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RpcError::Bind { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            RpcError::Bind { .. } => RecoveryHint::AlertOperator,
            RpcError::Remote { .. } => RecoveryHint::ReportToCaller,
            _ => RecoveryHint::Reconnect,
        }
    }

    pub fn codec(message: impl std::fmt::Display) -> Self {
        RpcError::Codec {
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 2.8 Result Type Aliases
// ----------------------------------------------------------------------------

pub type OmegaResult<T> = Result<T, OmegaError>;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;
