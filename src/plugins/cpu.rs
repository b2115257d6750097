// ----------------------------------------------------------------------------
// 12.3 CPU Plugin
// ----------------------------------------------------------------------------
// Usage percentages from deltas between consecutive /proc/stat readings.
// The first gather only primes the previous snapshot.
// ----------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use compact_str::CompactString;
use serde::Deserialize;

use super::{parse_config, read_proc, Plugin};
use crate::error::{PluginError, PluginResult};
use crate::metric::{Batch, Metric, ValueType};

/// Kernel clock ticks per second for /proc/stat counters.
const USER_HZ: f64 = 100.0;

const SAMPLE_CONFIG: &str = r#"
  ## Whether to report per-cpu stats or not
  percpu = true
  ## Whether to report total system cpu stats or not
  totalcpu = true
  ## If true, collect raw CPU time metrics
  collect_cpu_time = false
  ## If true, compute and report the sum of all non-idle CPU states
  report_active = false
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CpuConfig {
    percpu: bool,
    totalcpu: bool,
    collect_cpu_time: bool,
    report_active: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            percpu: true,
            totalcpu: true,
            collect_cpu_time: false,
            report_active: false,
        }
    }
}

/// Snapshot of CPU counters from /proc/stat for computing deltas.
#[derive(Debug, Clone, Default, PartialEq)]
struct CpuSnapshot {
    /// "cpu" for the aggregate line, "cpu0" for core 0, ...
    core_id: CompactString,
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuSnapshot {
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    fn active(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }

    /// Parse a cpu line: "cpu0 12345 678 9012 34567 890 12 34 56".
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let core_id = CompactString::from(parts.next()?);
        if !core_id.starts_with("cpu") {
            return None;
        }

        let user: u64 = parts.next()?.parse().ok()?;
        let nice: u64 = parts.next()?.parse().ok()?;
        let system: u64 = parts.next()?.parse().ok()?;
        let idle: u64 = parts.next()?.parse().ok()?;
        let mut optional = || -> u64 { parts.next().and_then(|s| s.parse().ok()).unwrap_or(0) };
        let iowait = optional();
        let irq = optional();
        let softirq = optional();
        let steal = optional();

        Some(Self {
            core_id,
            user,
            nice,
            system,
            idle,
            iowait,
            irq,
            softirq,
            steal,
        })
    }

    /// Tag value: the aggregate line is reported as `cpu-total`.
    fn tag(&self) -> &str {
        if self.core_id.as_str() == "cpu" {
            "cpu-total"
        } else {
            self.core_id.as_str()
        }
    }

    fn usage_metric(&self, prev: &CpuSnapshot, report_active: bool, now: chrono::DateTime<Utc>) -> Option<Metric> {
        let total_delta = self.total().saturating_sub(prev.total());
        if total_delta == 0 {
            return None;
        }
        let d = total_delta as f64;
        let pct = |cur: u64, old: u64| cur.saturating_sub(old) as f64 / d * 100.0;

        let mut metric = Metric::new("cpu", ValueType::Gauge, now)
            .with_tag("cpu", self.tag())
            .with_field("usage_user", pct(self.user, prev.user))
            .with_field("usage_system", pct(self.system, prev.system))
            .with_field("usage_idle", pct(self.idle, prev.idle))
            .with_field("usage_nice", pct(self.nice, prev.nice))
            .with_field("usage_iowait", pct(self.iowait, prev.iowait))
            .with_field("usage_irq", pct(self.irq, prev.irq))
            .with_field("usage_softirq", pct(self.softirq, prev.softirq))
            .with_field("usage_steal", pct(self.steal, prev.steal));
        if report_active {
            metric.add_field("usage_active", pct(self.active(), prev.active()));
        }
        Some(metric)
    }

    fn time_metric(&self, report_active: bool, now: chrono::DateTime<Utc>) -> Metric {
        let secs = |ticks: u64| ticks as f64 / USER_HZ;
        let mut metric = Metric::new("cpu", ValueType::Counter, now)
            .with_tag("cpu", self.tag())
            .with_field("time_user", secs(self.user))
            .with_field("time_system", secs(self.system))
            .with_field("time_idle", secs(self.idle))
            .with_field("time_nice", secs(self.nice))
            .with_field("time_iowait", secs(self.iowait))
            .with_field("time_irq", secs(self.irq))
            .with_field("time_softirq", secs(self.softirq))
            .with_field("time_steal", secs(self.steal));
        if report_active {
            metric.add_field("time_active", secs(self.active()));
        }
        metric
    }
}

fn parse_stat(content: &str) -> Vec<CpuSnapshot> {
    content.lines().filter_map(CpuSnapshot::parse).collect()
}

#[derive(Debug)]
pub struct CpuPlugin {
    config: CpuConfig,
    stat_path: PathBuf,
    last: HashMap<CompactString, CpuSnapshot>,
}

impl CpuPlugin {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            config: CpuConfig::default(),
            stat_path: proc_root.join("stat"),
            last: HashMap::new(),
        }
    }

    fn wanted(&self, snapshot: &CpuSnapshot) -> bool {
        if snapshot.core_id.as_str() == "cpu" {
            self.config.totalcpu
        } else {
            self.config.percpu
        }
    }
}

#[async_trait]
impl Plugin for CpuPlugin {
    fn name(&self) -> &str {
        "cpu"
    }

    fn description(&self) -> &str {
        "Read metrics about cpu usage"
    }

    fn sample_config(&self) -> &str {
        SAMPLE_CONFIG
    }

    fn configure(&mut self, config: &serde_json::Value) -> PluginResult<()> {
        self.config = parse_config("cpu", config)?;
        Ok(())
    }

    async fn gather(&mut self) -> PluginResult<Batch> {
        let content = read_proc(&self.stat_path).await?;
        let snapshots = parse_stat(&content);
        if snapshots.is_empty() {
            return Err(PluginError::ParseFailed {
                path: self.stat_path.clone(),
                message: "no cpu lines".to_string(),
            });
        }

        let now = Utc::now();
        let mut batch = Vec::with_capacity(snapshots.len() * 2);
        for snapshot in &snapshots {
            if !self.wanted(snapshot) {
                continue;
            }
            if self.config.collect_cpu_time {
                batch.push(snapshot.time_metric(self.config.report_active, now));
            }
            if let Some(prev) = self.last.get(&snapshot.core_id) {
                if let Some(metric) = snapshot.usage_metric(prev, self.config.report_active, now) {
                    batch.push(metric);
                }
            }
        }

        self.last = snapshots
            .into_iter()
            .map(|s| (s.core_id.clone(), s))
            .collect();
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FieldValue;
    use crate::plugins::fixtures::{write_proc, STAT_1, STAT_2};
    use serde_json::json;

    fn float(metric: &Metric, key: &str) -> f64 {
        match metric.field(key) {
            Some(FieldValue::Float(v)) => *v,
            other => panic!("{} is {:?}", key, other),
        }
    }

    #[test]
    fn test_parse_line() {
        let snap = CpuSnapshot::parse("cpu3 10 1 5 100 2").unwrap();
        assert_eq!(snap.core_id.as_str(), "cpu3");
        assert_eq!(snap.iowait, 2);
        assert_eq!(snap.steal, 0);
        assert_eq!(snap.total(), 118);
        assert!(CpuSnapshot::parse("intr 1 2 3").is_none());
        assert!(CpuSnapshot::parse("cpu0 1 2").is_none());
    }

    #[tokio::test]
    async fn test_usage_from_deltas() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), STAT_1);
        let mut plugin = CpuPlugin::new(dir.path());
        plugin
            .configure(&json!({ "percpu": false, "report_active": true }))
            .unwrap();

        // First reading only primes the snapshot.
        assert!(plugin.gather().await.unwrap().is_empty());

        write_proc(dir.path(), STAT_2);
        let batch = plugin.gather().await.unwrap();
        assert_eq!(batch.len(), 1);
        let metric = &batch[0];
        assert_eq!(metric.tag("cpu"), Some("cpu-total"));
        assert_eq!(metric.value_type(), ValueType::Gauge);
        // Deltas: user 50, system 50, idle 200 over 300 ticks.
        assert!((float(metric, "usage_user") - 100.0 / 6.0).abs() < 1e-9);
        assert!((float(metric, "usage_idle") - 200.0 / 3.0).abs() < 1e-9);
        assert!((float(metric, "usage_active") - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_percpu_and_cpu_time() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), STAT_1);
        let mut plugin = CpuPlugin::new(dir.path());
        plugin
            .configure(&json!({ "percpu": true, "totalcpu": false, "collect_cpu_time": true }))
            .unwrap();

        let batch = plugin.gather().await.unwrap();
        let tags: Vec<_> = batch.iter().map(|m| m.tag("cpu").unwrap().to_string()).collect();
        assert_eq!(tags, vec!["cpu0", "cpu1"]);
        assert!(batch.iter().all(|m| m.value_type() == ValueType::Counter));
        assert!((float(&batch[0], "time_user") - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_stat_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = CpuPlugin::new(dir.path());
        assert!(matches!(plugin.gather().await, Err(PluginError::ReadFailed { .. })));
    }
}
