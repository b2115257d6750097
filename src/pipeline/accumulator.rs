// ----------------------------------------------------------------------------
// 10.2 Accumulator
// ----------------------------------------------------------------------------

use std::sync::Arc;

use compact_str::CompactString;
use flume::TrySendError;
use tracing::warn;

use super::ChannelStats;
use crate::metric::{summarize, Batch};

/// Metrics shown in an overflow warning.
const SUMMARY_LIMIT: usize = 8;

/// Per-plugin handle pushing batches into the shared pipeline channel.
#[derive(Debug, Clone)]
pub struct Accumulator {
    name: CompactString,
    tx: flume::Sender<Batch>,
    rx: flume::Receiver<Batch>,
    stats: Arc<ChannelStats>,
}

impl Accumulator {
    pub(crate) fn new(
        name: impl Into<CompactString>,
        tx: flume::Sender<Batch>,
        rx: flume::Receiver<Batch>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            name: name.into(),
            tx,
            rx,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a batch without blocking.
    ///
    /// When the channel is full the oldest queued batch is evicted and the
    /// send retried once; if that also fails the new batch is dropped.
    pub fn add_metrics(&self, batch: Batch) {
        let batch = match self.tx.try_send(batch) {
            Ok(()) => {
                self.stats.record_send();
                self.stats.update_depth(self.tx.len());
                return;
            }
            Err(TrySendError::Full(batch)) => batch,
            Err(TrySendError::Disconnected(batch)) => {
                self.stats.record_drop(1);
                warn!(
                    target: "omega::pipeline",
                    accumulator = %self.name,
                    metrics = batch.len(),
                    "Pipeline is closed, the metrics will be ignored"
                );
                return;
            }
        };

        self.stats.record_backpressure();
        if self.rx.try_recv().is_ok() {
            self.stats.record_drop(1);
        }

        let summary = summarize(&batch, SUMMARY_LIMIT);
        match self.tx.try_send(batch) {
            Ok(()) => self.stats.record_send(),
            Err(_) => self.stats.record_drop(1),
        }
        warn!(
            target: "omega::pipeline",
            accumulator = %self.name,
            metrics = %summary,
            "Accumulator's buffer is overflow, the metrics will be ignored"
        );
    }
}
