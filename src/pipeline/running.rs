// ----------------------------------------------------------------------------
// 10.3 Running Output Pool
// ----------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Accumulator, ChannelStats, ChannelStatsSnapshot};
use crate::error::{OutputError, OutputResult};
use crate::metric::{summarize, Batch};
use crate::output::Output;

type OutputMap = Mutex<HashMap<Uuid, Arc<dyn Output>>>;

/// How long `stop` waits for the fan-out task to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the shared batch channel and fans every batch out to the
/// registered outputs.
#[derive(Debug)]
pub struct RunningOutput {
    outputs: Arc<OutputMap>,
    tx: flume::Sender<Batch>,
    rx: flume::Receiver<Batch>,
    stats: Arc<ChannelStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps an output registered; dropping it deregisters the output.
#[derive(Debug)]
pub struct OutputRegistration {
    id: Uuid,
    outputs: Weak<OutputMap>,
}

impl OutputRegistration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn deregister(self) {}
}

impl Drop for OutputRegistration {
    fn drop(&mut self) {
        if let Some(outputs) = self.outputs.upgrade() {
            outputs.lock().remove(&self.id);
        }
    }
}

impl RunningOutput {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self {
            outputs: Arc::new(Mutex::new(HashMap::with_capacity(8))),
            tx,
            rx,
            stats: Arc::new(ChannelStats::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// A producer handle on the shared channel.
    pub fn accumulator(&self, name: &str) -> Accumulator {
        Accumulator::new(name, self.tx.clone(), self.rx.clone(), self.stats.clone())
    }

    pub fn register_output(&self, output: Arc<dyn Output>) -> OutputRegistration {
        let id = Uuid::now_v7();
        debug!(target: "omega::pipeline", output = output.name(), id = %id, "Output registered");
        self.outputs.lock().insert(id, output);
        OutputRegistration {
            id,
            outputs: Arc::downgrade(&self.outputs),
        }
    }

    /// Snapshot of the registered outputs.
    pub fn outputs(&self) -> Vec<Arc<dyn Output>> {
        self.outputs.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Connect every output, run their start hooks and launch the fan-out.
    pub async fn start(&self) -> OutputResult<()> {
        if self.task.lock().is_some() {
            return Err(OutputError::AlreadyStarted);
        }

        let outputs = self.outputs();
        for output in &outputs {
            output.connect().await?;
            output.start().await;
        }

        let handle = tokio::spawn(fan_out(
            self.outputs.clone(),
            self.rx.clone(),
            self.stats.clone(),
            self.cancel.clone(),
        ));

        let mut task = self.task.lock();
        if task.is_some() {
            handle.abort();
            return Err(OutputError::AlreadyStarted);
        }
        *task = Some(handle);
        info!(target: "omega::pipeline", outputs = outputs.len(), "Output pool started");
        Ok(())
    }

    /// Stop the fan-out, deliver what is still queued, then stop and close
    /// every output.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let outputs = self.outputs();
        for output in &outputs {
            output.stop().await;
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(target: "omega::pipeline", "Output pool did not drain in time");
            }
        }

        for output in &outputs {
            if let Err(e) = output.close().await {
                warn!(target: "omega::pipeline", output = output.name(), error = %e, "Close output failure");
            }
        }
        info!(target: "omega::pipeline", stats = ?self.stats.snapshot(), "Output pool stopped");
    }
}

async fn fan_out(
    outputs: Arc<OutputMap>,
    rx: flume::Receiver<Batch>,
    stats: Arc<ChannelStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = rx.recv_async() => match batch {
                Ok(batch) => deliver(&outputs, &batch, &stats, &rx).await,
                Err(_) => return,
            },
        }
    }

    while let Ok(batch) = rx.try_recv() {
        deliver(&outputs, &batch, &stats, &rx).await;
    }
}

async fn deliver(outputs: &OutputMap, batch: &Batch, stats: &ChannelStats, rx: &flume::Receiver<Batch>) {
    stats.record_receive();
    stats.update_depth(rx.len());

    let targets: Vec<Arc<dyn Output>> = outputs.lock().values().cloned().collect();
    for output in targets {
        if let Err(e) = output.write_metric(batch).await {
            error!(
                target: "omega::pipeline",
                output = output.name(),
                error = %e,
                hint = ?e.recovery_hint(),
                metrics = %summarize(batch, 4),
                "Write metrics failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{FieldValue, Metric, ValueType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Default)]
    struct Recording {
        seen: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl Output for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn connect(&self) -> OutputResult<()> {
            Ok(())
        }

        async fn close(&self) -> OutputResult<()> {
            Ok(())
        }

        async fn write_metric(&self, batch: &[Metric]) -> OutputResult<()> {
            if self.fail {
                return Err(OutputError::NotConnected { name: "recording".into() });
            }
            if let Some(FieldValue::UInt(i)) = batch[0].field("i") {
                self.seen.lock().push(*i);
            }
            Ok(())
        }
    }

    fn batch(i: u64) -> Batch {
        vec![Metric::new("seq", ValueType::Gauge, Utc::now()).with_field("i", i)]
    }

    async fn wait_len(output: &Recording, len: usize) {
        for _ in 0..200 {
            if output.seen.lock().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_most_recent_batches_survive_until_consumer_attaches() {
        let pool = RunningOutput::new(128);
        let acc = pool.accumulator("seq");
        for i in 0..200 {
            acc.add_metrics(batch(i));
        }

        let recording = Arc::new(Recording::default());
        let _reg = pool.register_output(recording.clone());
        pool.start().await.unwrap();
        wait_len(&recording, 128).await;

        let seen = recording.seen.lock().clone();
        assert_eq!(seen, (72..200).collect::<Vec<u64>>());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failing_output_does_not_block_others() {
        let pool = RunningOutput::new(16);
        let good = Arc::new(Recording::default());
        let bad = Arc::new(Recording { fail: true, ..Default::default() });
        let _g = pool.register_output(good.clone());
        let _b = pool.register_output(bad.clone());
        pool.start().await.unwrap();

        let acc = pool.accumulator("seq");
        for i in 0..5 {
            acc.add_metrics(batch(i));
        }
        wait_len(&good, 5).await;
        assert_eq!(good.seen.lock().clone(), vec![0, 1, 2, 3, 4]);
        assert!(bad.seen.lock().is_empty());
        pool.stop().await;
    }

    #[derive(Debug, Default)]
    struct Stalled {
        entered: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl Output for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn connect(&self) -> OutputResult<()> {
            Ok(())
        }

        async fn close(&self) -> OutputResult<()> {
            Ok(())
        }

        async fn write_metric(&self, _batch: &[Metric]) -> OutputResult<()> {
            if !self.entered.swap(true, Ordering::SeqCst) {
                self.release.notified().await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocked_output_holds_fan_out_and_buffer_keeps_newest() {
        let pool = RunningOutput::new(4);
        let good = Arc::new(Recording::default());
        let stalled = Arc::new(Stalled::default());
        let _g = pool.register_output(good.clone());
        let _s = pool.register_output(stalled.clone());
        pool.start().await.unwrap();

        let acc = pool.accumulator("seq");
        acc.add_metrics(batch(0));
        for _ in 0..200 {
            if stalled.entered.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(stalled.entered.load(Ordering::SeqCst));

        for i in 1..=10 {
            acc.add_metrics(batch(i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(good.seen.lock().iter().all(|i| *i == 0));

        stalled.release.notify_one();
        wait_len(&good, 5).await;
        assert_eq!(good.seen.lock().clone(), vec![0, 7, 8, 9, 10]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_deregister_and_double_start() {
        let pool = RunningOutput::new(4);
        let reg = pool.register_output(Arc::new(Recording::default()));
        assert_eq!(pool.len(), 1);
        reg.deregister();
        assert!(pool.is_empty());

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(OutputError::AlreadyStarted)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_batches() {
        let pool = RunningOutput::new(8);
        let recording = Arc::new(Recording::default());
        let _reg = pool.register_output(recording.clone());
        pool.start().await.unwrap();

        let acc = pool.accumulator("seq");
        for i in 0..3 {
            acc.add_metrics(batch(i));
        }
        pool.stop().await;
        assert_eq!(recording.seen.lock().clone(), vec![0, 1, 2]);
    }
}
