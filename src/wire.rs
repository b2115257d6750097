// ============================================================================
// SECTION 6: WIRE PROTOCOL
// ============================================================================
// Every omega RPC travels as length-delimited frames (u32 big-endian length
// prefix) carrying MessagePack documents:
// - watchdog control: Notify / Status
// - agent: Ping / Version / System
// - collector push: a stream of MetricSet frames, closed by EOF
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::warn;

use crate::error::{RpcError, RpcResult};
use crate::metric::{FieldValue, Metric, ValueType};
use crate::supervisor::ProcessState;

// ----------------------------------------------------------------------------
// 6.1 Framing
// ----------------------------------------------------------------------------

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub type FramedIo<T> = Framed<T, LengthDelimitedCodec>;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> FramedIo<T> {
    Framed::new(io, codec())
}

/// Encode and send one message.
pub async fn write_frame<T, M>(io: &mut FramedIo<T>, message: &M) -> RpcResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = rmp_serde::to_vec_named(message).map_err(RpcError::codec)?;
    io.send(Bytes::from(payload)).await.map_err(RpcError::codec)
}

/// Receive and decode one message; `None` on clean EOF.
pub async fn read_frame<T, M>(io: &mut FramedIo<T>) -> RpcResult<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match io.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(RpcError::codec(e)),
        Some(Ok(frame)) => rmp_serde::from_slice(&frame).map(Some).map_err(RpcError::codec),
    }
}

// ----------------------------------------------------------------------------
// 6.2 Watchdog Messages
// ----------------------------------------------------------------------------

/// External signal accepted by `Notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Start (or reload) the supervised process
    Up,
    /// Stop the supervised process
    Quit,
}

impl Display for ControlSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Up => f.write_str("up"),
            ControlSignal::Quit => f.write_str("quit"),
        }
    }
}

impl FromStr for ControlSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(ControlSignal::Up),
            "quit" => Ok(ControlSignal::Quit),
            other => Err(format!("not implement signal[{}]", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogRequest {
    Notify { signal: ControlSignal },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogResponse {
    Pid { pid: i32 },
    Status { state: ProcessState },
    Error { message: String },
}

// ----------------------------------------------------------------------------
// 6.3 Agent Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRequest {
    Ping,
    Version,
    System,
}

/// Host description returned by the agent `System` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub pid: u32,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentResponse {
    Pong { message: String },
    Version { version: String },
    System { info: SystemInfo },
    Error { message: String },
}

// ----------------------------------------------------------------------------
// 6.4 Metric Set
// ----------------------------------------------------------------------------

/// A batch of metrics as pushed to collectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricSet {
    pub metric_families: Vec<MetricFamily>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub unit: String,
    pub metric_type: ValueType,
    pub tags: Vec<Label>,
    pub fields: Vec<Field>,
    pub timestamp_nanos: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: WireValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Number {
    Double(f64),
    Int(i64),
    UInt(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Counter(Number),
    Gauge(Number),
    StateSet(Vec<State>),
    Info(Vec<Label>),
    Unknown(Number),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub enabled: bool,
}

fn skip_field(key: &str, value: &FieldValue, value_type: ValueType) {
    warn!(
        target: "omega::wire",
        key = key,
        val = %value,
        kind = value.kind(),
        value_type = %value_type,
        "assert field value failure"
    );
}

fn convert_metric(metric: &Metric) -> Option<MetricFamily> {
    let value_type = metric.value_type();
    let mut fields = Vec::with_capacity(metric.field_count());

    match value_type {
        ValueType::Counter => {
            for (key, value) in metric.fields() {
                let number = match value {
                    FieldValue::Float(v) => Number::Double(*v),
                    FieldValue::UInt(v) => Number::UInt(*v),
                    other => {
                        skip_field(key, other, value_type);
                        continue;
                    }
                };
                fields.push(Field {
                    name: key.to_string(),
                    value: WireValue::Counter(number),
                });
            }
        }
        ValueType::Gauge => {
            for (key, value) in metric.fields() {
                let number = match value {
                    FieldValue::Float(v) => Number::Double(*v),
                    FieldValue::Int(v) => Number::Int(*v),
                    FieldValue::UInt(v) => Number::Int(*v as i64),
                    other => {
                        skip_field(key, other, value_type);
                        continue;
                    }
                };
                fields.push(Field {
                    name: key.to_string(),
                    value: WireValue::Gauge(number),
                });
            }
        }
        ValueType::StateSet => {
            let mut states = Vec::with_capacity(metric.field_count());
            for (key, value) in metric.fields() {
                match value {
                    FieldValue::Bool(enabled) => states.push(State {
                        name: key.to_string(),
                        enabled: *enabled,
                    }),
                    other => skip_field(key, other, value_type),
                }
            }
            fields.push(Field {
                name: String::new(),
                value: WireValue::StateSet(states),
            });
        }
        ValueType::Info => {
            let mut labels = Vec::with_capacity(metric.field_count());
            for (key, value) in metric.fields() {
                match value {
                    FieldValue::Str(s) => labels.push(Label {
                        name: key.to_string(),
                        value: s.clone(),
                    }),
                    other => skip_field(key, other, value_type),
                }
            }
            fields.push(Field {
                name: String::new(),
                value: WireValue::Info(labels),
            });
        }
        ValueType::Unknown => {
            for (key, value) in metric.fields() {
                let number = match value {
                    FieldValue::Float(v) => Number::Double(*v),
                    FieldValue::Int(v) => Number::Int(*v),
                    other => {
                        skip_field(key, other, value_type);
                        continue;
                    }
                };
                fields.push(Field {
                    name: key.to_string(),
                    value: WireValue::Unknown(number),
                });
            }
        }
        ValueType::Summary | ValueType::Histogram | ValueType::GaugeHistogram => {
            warn!(
                target: "omega::wire",
                name = metric.name(),
                value_type = %value_type,
                "not implement metric switch"
            );
            return None;
        }
    }

    Some(MetricFamily {
        name: metric.name().to_string(),
        help: "unknown".to_string(),
        unit: "unknown".to_string(),
        metric_type: value_type,
        tags: metric
            .tags()
            .map(|(k, v)| Label {
                name: k.to_string(),
                value: v.to_string(),
            })
            .collect(),
        fields,
        timestamp_nanos: metric.timestamp().timestamp_nanos_opt().unwrap_or_default(),
    })
}

/// Convert a batch to its wire form. An empty batch has no wire form.
pub fn to_metric_set(batch: &[Metric]) -> Option<MetricSet> {
    if batch.is_empty() {
        return None;
    }
    Some(MetricSet {
        metric_families: batch.iter().filter_map(convert_metric).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_signal_parsing() {
        assert_eq!("UP".parse::<ControlSignal>(), Ok(ControlSignal::Up));
        assert_eq!("quit".parse::<ControlSignal>(), Ok(ControlSignal::Quit));
        assert!("reload".parse::<ControlSignal>().unwrap_err().contains("reload"));
    }

    #[test]
    fn test_empty_batch_has_no_set() {
        assert!(to_metric_set(&[]).is_none());
    }

    #[test]
    fn test_counter_and_gauge_conversion() {
        let now = Utc::now();
        let batch = vec![
            Metric::new("cpu", ValueType::Counter, now)
                .with_tag("cpu", "cpu-total")
                .with_field("time_user", 1.5)
                .with_field("ticks", 7u64)
                .with_field("bad", -1i64),
            Metric::new("mem", ValueType::Gauge, now)
                .with_field("total", 1024u64)
                .with_field("delta", -3i64)
                .with_field("flag", true),
        ];
        let set = to_metric_set(&batch).unwrap();
        assert_eq!(set.metric_families.len(), 2);

        let cpu = &set.metric_families[0];
        assert_eq!(cpu.metric_type, ValueType::Counter);
        assert_eq!(cpu.tags, vec![Label { name: "cpu".into(), value: "cpu-total".into() }]);
        assert_eq!(
            cpu.fields,
            vec![
                Field { name: "time_user".into(), value: WireValue::Counter(Number::Double(1.5)) },
                Field { name: "ticks".into(), value: WireValue::Counter(Number::UInt(7)) },
            ]
        );

        let mem = &set.metric_families[1];
        assert_eq!(
            mem.fields,
            vec![
                Field { name: "total".into(), value: WireValue::Gauge(Number::Int(1024)) },
                Field { name: "delta".into(), value: WireValue::Gauge(Number::Int(-3)) },
            ]
        );
    }

    #[test]
    fn test_state_set_info_and_skipped_types() {
        let now = Utc::now();
        let batch = vec![
            Metric::new("service", ValueType::StateSet, now)
                .with_field("running", true)
                .with_field("failed", false)
                .with_field("noise", 1.0),
            Metric::new("host", ValueType::Info, now).with_field("kernel", "6.1.0"),
            Metric::new("latency", ValueType::Histogram, now).with_field("p99", 1.0),
        ];
        let set = to_metric_set(&batch).unwrap();
        assert_eq!(set.metric_families.len(), 2);
        assert_eq!(
            set.metric_families[0].fields,
            vec![Field {
                name: String::new(),
                value: WireValue::StateSet(vec![
                    State { name: "running".into(), enabled: true },
                    State { name: "failed".into(), enabled: false },
                ]),
            }]
        );
        assert_eq!(
            set.metric_families[1].fields,
            vec![Field {
                name: String::new(),
                value: WireValue::Info(vec![Label { name: "kernel".into(), value: "6.1.0".into() }]),
            }]
        );
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client = framed(a);
        let mut server = framed(b);

        write_frame(&mut client, &WatchdogRequest::Notify { signal: ControlSignal::Quit })
            .await
            .unwrap();
        let got: Option<WatchdogRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(got, Some(WatchdogRequest::Notify { signal: ControlSignal::Quit }));

        drop(client);
        let eof: Option<WatchdogRequest> = read_frame(&mut server).await.unwrap();
        assert_eq!(eof, None);
    }
}
