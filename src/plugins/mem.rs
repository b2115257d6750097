// ----------------------------------------------------------------------------
// 12.4 Memory Plugin
// ----------------------------------------------------------------------------

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use super::{read_proc, Plugin};
use crate::error::{PluginError, PluginResult};
use crate::metric::{Batch, Metric, ValueType};

/// Parse /proc/meminfo into bytes per key.
fn parse_meminfo(content: &str) -> HashMap<&str, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let bytes = match parts.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key.trim(), bytes))
        })
        .collect()
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[derive(Debug)]
pub struct MemPlugin {
    meminfo_path: PathBuf,
}

impl MemPlugin {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            meminfo_path: proc_root.join("meminfo"),
        }
    }
}

#[async_trait]
impl Plugin for MemPlugin {
    fn name(&self) -> &str {
        "mem"
    }

    fn description(&self) -> &str {
        "Read metrics about memory usage"
    }

    fn sample_config(&self) -> &str {
        "\n  ## no configuration\n"
    }

    fn configure(&mut self, _config: &serde_json::Value) -> PluginResult<()> {
        Ok(())
    }

    async fn gather(&mut self) -> PluginResult<Batch> {
        let content = read_proc(&self.meminfo_path).await?;
        let info = parse_meminfo(&content);
        let get = |key: &str| info.get(key).copied().unwrap_or(0);

        let total = *info.get("MemTotal").ok_or_else(|| PluginError::ParseFailed {
            path: self.meminfo_path.clone(),
            message: "MemTotal missing".to_string(),
        })?;
        let free = get("MemFree");
        let buffered = get("Buffers");
        let cached = get("Cached");
        let available = info
            .get("MemAvailable")
            .copied()
            .unwrap_or(free + buffered + cached);
        let used = total.saturating_sub(free + buffered + cached);

        let metric = Metric::new("mem", ValueType::Gauge, Utc::now())
            .with_field("total", total)
            .with_field("available", available)
            .with_field("used", used)
            .with_field("free", free)
            .with_field("buffered", buffered)
            .with_field("cached", cached)
            .with_field("used_percent", percent(used, total))
            .with_field("available_percent", percent(available, total));
        Ok(vec![metric])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FieldValue;
    use crate::plugins::fixtures::{write_proc, STAT_1};

    #[tokio::test]
    async fn test_gather_mem() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), STAT_1);
        let mut plugin = MemPlugin::new(dir.path());

        let batch = plugin.gather().await.unwrap();
        assert_eq!(batch.len(), 1);
        let metric = &batch[0];
        assert_eq!(metric.field("total"), Some(&FieldValue::UInt(1000 * 1024)));
        assert_eq!(metric.field("used"), Some(&FieldValue::UInt(550 * 1024)));
        assert_eq!(metric.field("available"), Some(&FieldValue::UInt(500 * 1024)));
        match metric.field("used_percent") {
            Some(FieldValue::Float(v)) => assert!((v - 55.0).abs() < 1e-9),
            other => panic!("used_percent is {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_total_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemFree: 10 kB\n").unwrap();
        let mut plugin = MemPlugin::new(dir.path());
        assert!(matches!(plugin.gather().await, Err(PluginError::ParseFailed { .. })));
    }
}
