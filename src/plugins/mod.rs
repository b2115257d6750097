// ============================================================================
// SECTION 12: INPUT PLUGINS
// ============================================================================
// Metric producers driven by the agent's tickers. Every plugin reads from a
// configurable proc root so it can be exercised against fixture files.
// The registry is an explicit object filled by the composition root.
// ============================================================================

mod cpu;
mod mem;
mod system;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::metric::Batch;

pub use cpu::CpuPlugin;
pub use mem::MemPlugin;
pub use system::{read_system_info, SystemPlugin};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

// ----------------------------------------------------------------------------
// 12.1 Plugin Trait
// ----------------------------------------------------------------------------

/// A metric-gathering input.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Registry name; also the key of the plugin's config table.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// TOML snippet documenting the accepted settings.
    fn sample_config(&self) -> &str;

    /// Apply the plugin's `[plugins.<name>]` table.
    fn configure(&mut self, config: &serde_json::Value) -> PluginResult<()>;

    /// Collect one batch.
    async fn gather(&mut self) -> PluginResult<Batch>;
}

/// Deserialize a plugin config blob, mapping failures to `InvalidConfig`.
pub(crate) fn parse_config<T: DeserializeOwned>(plugin: &str, config: &serde_json::Value) -> PluginResult<T> {
    serde_json::from_value(config.clone()).map_err(|e| PluginError::InvalidConfig {
        plugin: plugin.to_string(),
        message: e.to_string(),
    })
}

pub(crate) async fn read_proc(path: &Path) -> PluginResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PluginError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })
}

// ----------------------------------------------------------------------------
// 12.2 Plugin Registry
// ----------------------------------------------------------------------------

/// Named set of plugins, each driven by its own ticker and accumulator.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `cpu`, `mem` and `system` plugins.
    pub fn with_builtin() -> Self {
        Self::with_builtin_at(DEFAULT_PROC_ROOT)
    }

    pub fn with_builtin_at(proc_root: impl Into<PathBuf>) -> Self {
        let proc_root = proc_root.into();
        let mut registry = Self::new();
        registry.register(Box::new(CpuPlugin::new(&proc_root)));
        registry.register(Box::new(MemPlugin::new(&proc_root)));
        registry.register(Box::new(SystemPlugin::new(&proc_root)));
        registry
    }

    /// Add a plugin, replacing any plugin of the same name.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            warn!(target: "omega::plugins", plugin = %name, "Plugin replaced");
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins.get(name).map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Hand each plugin its config table. Plugins without a table keep
    /// their defaults; tables naming no plugin are ignored.
    pub fn configure(&mut self, configs: &HashMap<String, serde_json::Value>) -> PluginResult<()> {
        for (name, config) in configs {
            match self.plugins.get_mut(name) {
                Some(plugin) => {
                    plugin.configure(config)?;
                    debug!(target: "omega::plugins", plugin = %name, "Plugin configured");
                }
                None => warn!(target: "omega::plugins", plugin = %name, "No plugin for config table"),
            }
        }
        Ok(())
    }

    pub fn into_plugins(self) -> Vec<Box<dyn Plugin>> {
        self.plugins.into_values().collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;
    use std::path::Path;

    pub const STAT_1: &str = "\
cpu  100 0 50 800 50 0 0 0 0 0
cpu0 50 0 25 400 25 0 0 0 0 0
cpu1 50 0 25 400 25 0 0 0 0 0
intr 12345
ctxt 999
";

    pub const STAT_2: &str = "\
cpu  150 0 100 1000 50 0 0 0 0 0
cpu0 80 0 50 500 25 0 0 0 0 0
cpu1 70 0 50 500 25 0 0 0 0 0
intr 12399
ctxt 1200
";

    pub const MEMINFO: &str = "\
MemTotal:        1000 kB
MemFree:          200 kB
MemAvailable:     500 kB
Buffers:          100 kB
Cached:           150 kB
SwapTotal:          0 kB
";

    pub fn write_proc(root: &Path, stat: &str) {
        fs::create_dir_all(root.join("sys/kernel")).unwrap();
        fs::write(root.join("stat"), stat).unwrap();
        fs::write(root.join("meminfo"), MEMINFO).unwrap();
        fs::write(root.join("loadavg"), "0.50 0.25 0.10 1/200 4242\n").unwrap();
        fs::write(root.join("uptime"), "3600.55 7000.10\n").unwrap();
        fs::write(root.join("sys/kernel/hostname"), "node-1\n").unwrap();
        fs::write(root.join("sys/kernel/osrelease"), "6.1.0-test\n").unwrap();
    }
}
