// ----------------------------------------------------------------------------
// 11.1 Collector Stream Output
// ----------------------------------------------------------------------------
// Pushes MetricSet frames over one long-lived TCP stream to a collector
// resolved from the registry (round-robin), falling back to static
// addresses. A failed send drops the connection and reconnects with
// backoff; batches arriving meanwhile wait in the shared pipeline channel.
// ----------------------------------------------------------------------------

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Output;
use crate::error::{OutputError, OutputResult};
use crate::metric::Metric;
use crate::registry::{Registry, RoundRobin};
use crate::wire::{framed, to_metric_set, write_frame, FramedIo};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff before reconnect attempt `attempt` (0-based): 1s doubling up to
/// 256s, then starting over at 1s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt % 9))
}

#[derive(Debug)]
pub struct StreamOutput {
    name: String,
    registry: Option<Registry>,
    service: String,
    static_addrs: Vec<String>,
    picker: RoundRobin,
    dial_timeout: Duration,
    conn: Mutex<Option<FramedIo<TcpStream>>>,
    stopped: CancellationToken,
}

impl StreamOutput {
    /// `service` is the registry key collectors register under.
    pub fn new(service: impl Into<String>, registry: Option<Registry>, static_addrs: Vec<String>) -> Self {
        Self {
            name: "stream".to_string(),
            registry,
            service: service.into(),
            static_addrs,
            picker: RoundRobin::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            conn: Mutex::new(None),
            stopped: CancellationToken::new(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    async fn candidates(&self) -> OutputResult<Vec<String>> {
        if let Some(registry) = &self.registry {
            match registry.resolve(&self.service).await {
                Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                Ok(_) => debug!(target: "omega::output", service = %self.service, "No collector registered"),
                Err(e) => warn!(target: "omega::output", service = %self.service, error = %e, "Resolve collector failure"),
            }
        }
        if self.static_addrs.is_empty() {
            return Err(OutputError::NoCollector {
                service: self.service.clone(),
            });
        }
        Ok(self.static_addrs.clone())
    }

    async fn dial(&self) -> OutputResult<FramedIo<TcpStream>> {
        let addrs = self.candidates().await?;
        let addr = self
            .picker
            .pick(&addrs)
            .ok_or_else(|| OutputError::NoCollector {
                service: self.service.clone(),
            })?
            .to_string();

        let connect_failed = |message: String| OutputError::ConnectFailed {
            name: self.name.clone(),
            target: addr.clone(),
            message,
        };
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| connect_failed(format!("dial timeout after {:?}", self.dial_timeout)))?
            .map_err(|e| connect_failed(e.to_string()))?;
        stream.set_nodelay(true).ok();

        info!(target: "omega::output", collector = %addr, "Connected to collector");
        Ok(framed(stream))
    }

    /// Redial until it works or the output is stopped.
    async fn reconnect(&self, conn: &mut Option<FramedIo<TcpStream>>) {
        let mut attempt: u32 = 0;
        loop {
            let delay = reconnect_delay(attempt);
            tokio::select! {
                _ = self.stopped.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.dial().await {
                Ok(io) => {
                    *conn = Some(io);
                    return;
                }
                Err(e) => warn!(
                    target: "omega::output",
                    retry = attempt + 1,
                    delay_secs = delay.as_secs(),
                    dial_timeout_secs = self.dial_timeout.as_secs(),
                    error = %e,
                    "Prepare to reconnect to collector"
                ),
            }
            attempt = attempt.wrapping_add(1);
        }
    }
}

#[async_trait]
impl Output for StreamOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> OutputResult<()> {
        let io = self.dial().await?;
        *self.conn.lock().await = Some(io);
        Ok(())
    }

    async fn close(&self) -> OutputResult<()> {
        if let Some(mut io) = self.conn.lock().await.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut io).await {
                debug!(target: "omega::output", error = %e, "Close collector stream failure");
            }
        }
        Ok(())
    }

    async fn write_metric(&self, batch: &[Metric]) -> OutputResult<()> {
        let Some(set) = to_metric_set(batch) else {
            return Ok(());
        };

        let mut conn = self.conn.lock().await;
        let message = match conn.as_mut() {
            Some(io) => match write_frame(io, &set).await {
                Ok(()) => return Ok(()),
                Err(e) => e.to_string(),
            },
            None if self.stopped.is_cancelled() => {
                return Err(OutputError::NotConnected {
                    name: self.name.clone(),
                })
            }
            None => "no connection".to_string(),
        };

        // The failed batch is not resent.
        if let Some(mut io) = conn.take() {
            let _ = SinkExt::<Bytes>::close(&mut io).await;
        }
        warn!(target: "omega::output", error = %message, "Send to collector failure, reconnecting");
        self.reconnect(&mut conn).await;

        Err(OutputError::SendFailed {
            name: self.name.clone(),
            message,
        })
    }

    async fn stop(&self) {
        self.stopped.cancel();
    }
}
