// ----------------------------------------------------------------------------
// 12.5 System Plugin
// ----------------------------------------------------------------------------
// Load averages, uptime and cpu count as gauges, plus a `host` info metric
// carrying the host name and kernel release.
// ----------------------------------------------------------------------------

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::{read_proc, Plugin};
use crate::error::{PluginError, PluginResult};
use crate::metric::{Batch, Metric, ValueType};
use crate::wire::SystemInfo;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LoadAvg {
    load1: f64,
    load5: f64,
    load15: f64,
}

fn parse_loadavg(content: &str) -> Option<LoadAvg> {
    let mut parts = content.split_whitespace();
    Some(LoadAvg {
        load1: parts.next()?.parse().ok()?,
        load5: parts.next()?.parse().ok()?,
        load15: parts.next()?.parse().ok()?,
    })
}

fn parse_uptime(content: &str) -> Option<u64> {
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// Count `cpuN` lines in /proc/stat.
fn count_cpus(stat: &str) -> u64 {
    stat.lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .map(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .count() as u64
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Describe the host for the agent `System` call.
pub fn read_system_info(proc_root: &Path) -> SystemInfo {
    let uptime_secs = std::fs::read_to_string(proc_root.join("uptime"))
        .ok()
        .and_then(|s| parse_uptime(&s))
        .unwrap_or(0);
    SystemInfo {
        hostname: read_trimmed(&proc_root.join("sys/kernel/hostname")).unwrap_or_else(|| "unknown".to_string()),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel: read_trimmed(&proc_root.join("sys/kernel/osrelease")).unwrap_or_else(|| "unknown".to_string()),
        pid: std::process::id(),
        uptime_secs,
    }
}

#[derive(Debug)]
pub struct SystemPlugin {
    proc_root: PathBuf,
}

impl SystemPlugin {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        "system"
    }

    fn description(&self) -> &str {
        "Read metrics about system load & uptime"
    }

    fn sample_config(&self) -> &str {
        "\n  ## no configuration\n"
    }

    fn configure(&mut self, _config: &serde_json::Value) -> PluginResult<()> {
        Ok(())
    }

    async fn gather(&mut self) -> PluginResult<Batch> {
        let loadavg_path = self.proc_root.join("loadavg");
        let load = parse_loadavg(&read_proc(&loadavg_path).await?).ok_or_else(|| PluginError::ParseFailed {
            path: loadavg_path.clone(),
            message: "expected three load averages".to_string(),
        })?;

        let uptime_path = self.proc_root.join("uptime");
        let uptime = parse_uptime(&read_proc(&uptime_path).await?).ok_or_else(|| PluginError::ParseFailed {
            path: uptime_path.clone(),
            message: "expected uptime seconds".to_string(),
        })?;

        let n_cpus = count_cpus(&read_proc(&self.proc_root.join("stat")).await?);

        let now = Utc::now();
        let info = read_system_info(&self.proc_root);
        Ok(vec![
            Metric::new("system", ValueType::Gauge, now)
                .with_field("load1", load.load1)
                .with_field("load5", load.load5)
                .with_field("load15", load.load15)
                .with_field("n_cpus", n_cpus)
                .with_field("uptime", uptime),
            Metric::new("host", ValueType::Info, now)
                .with_field("hostname", info.hostname)
                .with_field("kernel", info.kernel)
                .with_field("os", info.os)
                .with_field("arch", info.arch),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FieldValue;
    use crate::plugins::fixtures::{write_proc, STAT_1};

    #[test]
    fn test_parsers() {
        assert_eq!(
            parse_loadavg("0.50 0.25 0.10 1/200 4242"),
            Some(LoadAvg { load1: 0.5, load5: 0.25, load15: 0.1 })
        );
        assert_eq!(parse_loadavg("0.5"), None);
        assert_eq!(parse_uptime("3600.55 7000.10"), Some(3600));
        assert_eq!(count_cpus(STAT_1), 2);
    }

    #[tokio::test]
    async fn test_gather_system_and_host() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), STAT_1);
        let mut plugin = SystemPlugin::new(dir.path());

        let batch = plugin.gather().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].field("n_cpus"), Some(&FieldValue::UInt(2)));
        assert_eq!(batch[0].field("uptime"), Some(&FieldValue::UInt(3600)));
        assert_eq!(batch[1].value_type(), ValueType::Info);
        assert_eq!(batch[1].field("hostname"), Some(&FieldValue::Str("node-1".into())));
        assert_eq!(batch[1].field("kernel"), Some(&FieldValue::Str("6.1.0-test".into())));
    }

    #[test]
    fn test_system_info_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let info = read_system_info(dir.path());
        assert_eq!(info.hostname, "unknown");
        assert_eq!(info.uptime_secs, 0);
        assert_eq!(info.pid, std::process::id());
    }
}
