// ============================================================================
// SECTION 5: METRIC MODEL
// ============================================================================
// A metric is a named observation:
// - tags kept sorted by key and unique
// - fields upserted by key (last write wins), insertion order preserved
// - a value type telling outputs how to encode the fields
// Metrics are built by plugins and never mutated once they enter the
// pipeline.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

// ----------------------------------------------------------------------------
// 5.1 Value Types
// ----------------------------------------------------------------------------

/// How a metric's fields should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ValueType {
    Counter,
    Gauge,
    StateSet,
    Info,
    Summary,
    Histogram,
    GaugeHistogram,
    #[default]
    Unknown,
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Counter => "counter",
            ValueType::Gauge => "gauge",
            ValueType::StateSet => "state_set",
            ValueType::Info => "info",
            ValueType::Summary => "summary",
            ValueType::Histogram => "histogram",
            ValueType::GaugeHistogram => "gauge_histogram",
            ValueType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Short name of the variant, used in conversion warnings.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Float(_) => "float",
            FieldValue::Int(_) => "int",
            FieldValue::UInt(_) => "uint",
            FieldValue::Bool(_) => "bool",
            FieldValue::Str(_) => "string",
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::UInt(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{:?}", v),
        }
    }
}

macro_rules! impl_field_from {
    ($($t:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$t> for FieldValue {
                fn from(v: $t) -> Self {
                    FieldValue::$variant(v as $target)
                }
            }
        )*
    };
}

impl_field_from! {
    f64 => Float as f64,
    f32 => Float as f64,
    i64 => Int as i64,
    i32 => Int as i64,
    i16 => Int as i64,
    i8 => Int as i64,
    isize => Int as i64,
    u64 => UInt as u64,
    u32 => UInt as u64,
    u16 => UInt as u64,
    u8 => UInt as u64,
    usize => UInt as u64,
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Str(String::from_utf8_lossy(&v).into_owned())
    }
}

// ----------------------------------------------------------------------------
// 5.2 Metric
// ----------------------------------------------------------------------------

/// A named observation with tags and fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    name: CompactString,
    tags: BTreeMap<CompactString, CompactString>,
    fields: Vec<(CompactString, FieldValue)>,
    timestamp: DateTime<Utc>,
    value_type: ValueType,
}

impl Metric {
    /// Create an empty metric stamped with the given time.
    pub fn new(name: impl Into<CompactString>, value_type: ValueType, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: Vec::new(),
            timestamp,
            value_type,
        }
    }

    /// Builder-style tag insertion.
    pub fn with_tag(mut self, key: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        self.add_tag(key, value);
        self
    }

    /// Builder-style field upsert.
    pub fn with_field(mut self, key: impl Into<CompactString>, value: impl Into<FieldValue>) -> Self {
        self.add_field(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<CompactString>) {
        self.name = name.into();
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    /// Tags in key order.
    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(CompactString::as_str)
    }

    /// Insert or replace a tag.
    pub fn add_tag(&mut self, key: impl Into<CompactString>, value: impl Into<CompactString>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Insert a field, replacing an existing value for the same key.
    pub fn add_field(&mut self, key: impl Into<CompactString>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k.as_str() == key.as_str()) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Stable identity of the series: name plus sorted tags.
    pub fn hash_id(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\n");
        for (k, v) in &self.tags {
            hasher.update(k.as_bytes());
            hasher.update(b"\n");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        hasher.digest()
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} map[", self.name)?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", k, v)?;
        }
        f.write_str("] map[")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", k, v)?;
        }
        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1000));
        write!(f, "] {}", nanos)
    }
}

/// One plugin gather result; the unit moved through the pipeline.
pub type Batch = Vec<Metric>;

/// Short human-readable rendering of a batch for log lines.
pub fn summarize(batch: &[Metric], limit: usize) -> String {
    let mut out = String::new();
    for metric in batch.iter().take(limit) {
        if !out.is_empty() {
            out.push_str("; ");
        }
        out.push_str(&metric.to_string());
    }
    if batch.len() > limit {
        out.push_str(&format!("; ... {} more", batch.len() - limit));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_tags_are_sorted_and_unique() {
        let metric = Metric::new("cpu", ValueType::Gauge, at(1))
            .with_tag("zone", "b")
            .with_tag("cpu", "cpu-total")
            .with_tag("zone", "a");

        let tags: Vec<_> = metric.tags().collect();
        assert_eq!(tags, vec![("cpu", "cpu-total"), ("zone", "a")]);
    }

    #[test]
    fn test_field_upsert_keeps_order() {
        let mut metric = Metric::new("mem", ValueType::Gauge, at(1));
        metric.add_field("total", 10u64);
        metric.add_field("used", 4u64);
        metric.add_field("total", 12u64);

        let fields: Vec<_> = metric.fields().map(|(k, v)| (k.to_string(), v.clone())).collect();
        assert_eq!(
            fields,
            vec![
                ("total".to_string(), FieldValue::UInt(12)),
                ("used".to_string(), FieldValue::UInt(4)),
            ]
        );
        assert_eq!(metric.field_count(), 2);
    }

    #[test]
    fn test_display_format() {
        let metric = Metric::new("cpu", ValueType::Gauge, at(2))
            .with_tag("cpu", "cpu0")
            .with_field("usage_idle", 99.5)
            .with_field("state", "ok");
        assert_eq!(
            metric.to_string(),
            "cpu map[cpu:cpu0] map[usage_idle:99.5 state:\"ok\"] 2000000000"
        );
    }

    #[test]
    fn test_hash_id_ignores_fields_and_time() {
        let a = Metric::new("cpu", ValueType::Gauge, at(1)).with_tag("cpu", "cpu0").with_field("x", 1.0);
        let b = Metric::new("cpu", ValueType::Counter, at(9)).with_tag("cpu", "cpu0").with_field("y", 2u64);
        let c = Metric::new("cpu", ValueType::Gauge, at(1)).with_tag("cpu", "cpu1");
        assert_eq!(a.hash_id(), b.hash_id());
        assert_ne!(a.hash_id(), c.hash_id());
    }

    #[test]
    fn test_summarize_truncates() {
        let batch: Batch = (0..5)
            .map(|i| Metric::new(format!("m{}", i), ValueType::Gauge, at(0)))
            .collect();
        let summary = summarize(&batch, 2);
        assert!(summary.starts_with("m0 "));
        assert!(summary.ends_with("... 3 more"));
    }

    proptest! {
        #[test]
        fn prop_tag_order_independent_of_insertion(
            tags in proptest::collection::vec(("[a-e]{1,3}", "[a-z]{0,4}"), 0..12)
        ) {
            let mut forward = Metric::new("m", ValueType::Unknown, at(0));
            for (k, v) in &tags {
                forward.add_tag(k.as_str(), v.as_str());
            }
            let keys: Vec<_> = forward.tags().map(|(k, _)| k.to_string()).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(keys, sorted);
        }
    }
}
