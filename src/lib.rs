//! # Omega - Fleet Monitoring Agent & Watchdog
//!
//! Lightweight host agents collect metrics and stream them to collectors,
//! while a watchdog process supervises, reloads and stops the agent binary.
//! Every long-running process publishes itself into a lease-backed service
//! registry so peers can resolve it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │ omega (agent)                                                             │
//! │   PLUGINS → TICKER → ACCUMULATOR → BOUNDED CHANNEL → FAN-OUT → OUTPUTS    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ omega-watchdog                                                            │
//! │   CONTROL RPC → NOTIFY GATE → SUPERVISOR (spawn / monitor / quit / reload)│
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │ REGISTRY: lease grant → put → keep-alive → re-register on loss            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`supervisor`]: child process lifecycle and the `Notify` admission gate
//! - [`registry`]: lease-backed registration and discovery
//! - [`pipeline`]: accumulators, the shared drop-oldest buffer and output pool
//! - [`ticker`]: phase-aligned periodic scheduling
//! - [`output`]: network sinks fed by the pipeline

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod agent;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metric;
pub mod output;
pub mod pidfile;
pub mod pipeline;
pub mod plugins;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod ticker;
pub mod wire;

pub use error::{OmegaError, OmegaResult, RecoveryHint};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version, reported by every binary and the agent `Version` RPC.
pub const OMEGA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix shared by every service key written to the registry.
pub const ETCD_KEY_PREFIX: &str = "grpclb/service";

/// Service names used to build registry keys.
pub const SERVICE_WATCHDOG: &str = "omega-watchdog";
pub const SERVICE_AGENT: &str = "omega";
pub const SERVICE_COLLECTOR: &str = "omega-collector";

/// Build the registry service key `<prefix>/<service>/<group>`.
pub fn service_key(prefix: &str, service: &str, group: &str) -> String {
    format!("{}/{}/{}", prefix.trim_matches('/'), service, group)
}
