// ============================================================================
// SECTION 13: AGENT
// ============================================================================
// Wires the metric path of the `omega` binary:
//
//   plugin ──tick──▶ gather ──▶ accumulator ──▶ shared buffer ──▶ outputs
//
// Each plugin runs in its own task driven by its own aligned ticker. The
// output pool is started before the first tick and drained on shutdown.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OmegaConfig;
use crate::error::OmegaResult;
use crate::output::{Output, StreamOutput};
use crate::pipeline::{Accumulator, RunningOutput};
use crate::plugins::{Plugin, PluginRegistry};
use crate::registry::Registry;
use crate::ticker::{AlignedTicker, Ticker};
use crate::{service_key, SERVICE_COLLECTOR};

/// Timing of the gather loops.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub period: Duration,
    pub jitter: Duration,
    pub offset: Duration,
}

#[derive(Debug)]
pub struct Agent {
    schedule: Schedule,
    buffer_capacity: usize,
    plugins: PluginRegistry,
    plugin_configs: HashMap<String, serde_json::Value>,
    outputs: Vec<Arc<dyn Output>>,
}

impl Agent {
    /// Agent pushing to the collectors of the configured group, found
    /// through `registry` or the static `collector_addrs`.
    pub fn new(config: &OmegaConfig, plugins: PluginRegistry, registry: Option<Registry>) -> Self {
        let service = service_key(&config.global.key_prefix, SERVICE_COLLECTOR, &config.global.group_name);
        let stream: Arc<dyn Output> = Arc::new(StreamOutput::new(
            service,
            registry,
            config.agent.collector_addrs.clone(),
        ));
        Self {
            schedule: Schedule {
                period: config.agent.period,
                jitter: config.agent.jitter,
                offset: config.agent.offset,
            },
            buffer_capacity: config.agent.buffer_capacity,
            plugins,
            plugin_configs: config.plugins.clone(),
            outputs: vec![stream],
        }
    }

    /// Replace the default collector stream with explicit outputs.
    pub fn with_outputs(mut self, outputs: Vec<Arc<dyn Output>>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Gather until `cancel` fires, then drain the pipeline. `ready` is
    /// signalled once every gather loop is running.
    pub async fn run(mut self, cancel: CancellationToken, ready: Option<oneshot::Sender<()>>) -> OmegaResult<()> {
        self.plugins.configure(&self.plugin_configs)?;

        let pool = RunningOutput::new(self.buffer_capacity);
        let _registrations: Vec<_> = self
            .outputs
            .iter()
            .map(|output| pool.register_output(Arc::clone(output)))
            .collect();
        pool.start().await?;

        let mut tickers = Vec::with_capacity(self.plugins.len());
        let mut loops: Vec<JoinHandle<()>> = Vec::with_capacity(self.plugins.len());
        for plugin in self.plugins.into_plugins() {
            let ticker = AlignedTicker::new(self.schedule.period, self.schedule.jitter, self.schedule.offset);
            let accumulator = pool.accumulator(plugin.name());
            loops.push(tokio::spawn(gather_loop(plugin, ticker.elapsed(), accumulator)));
            tickers.push(ticker);
        }

        info!(
            target: "omega::agent",
            plugins = loops.len(),
            period = ?self.schedule.period,
            "Agent started"
        );
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        cancel.cancelled().await;
        info!(target: "omega::agent", "Starting graceful shutdown");
        let started = Instant::now();

        for ticker in &tickers {
            ticker.stop();
        }
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(target: "omega::agent", error = %e, "Gather loop panicked");
            }
        }
        pool.stop().await;

        info!(
            target: "omega::agent",
            duration_ms = started.elapsed().as_millis() as u64,
            stats = ?pool.stats(),
            "Agent shutdown complete"
        );
        Ok(())
    }
}

async fn gather_loop(mut plugin: Box<dyn Plugin>, ticks: flume::Receiver<DateTime<Utc>>, accumulator: Accumulator) {
    while let Ok(tick) = ticks.recv_async().await {
        match plugin.gather().await {
            Ok(batch) if batch.is_empty() => {
                debug!(target: "omega::agent", plugin = plugin.name(), %tick, "Nothing gathered");
            }
            Ok(batch) => accumulator.add_metrics(batch),
            Err(e) => error!(
                target: "omega::agent",
                plugin = plugin.name(),
                error = %e,
                "Gather metrics failure"
            ),
        }
    }
    debug!(target: "omega::agent", plugin = plugin.name(), "Gather loop stopped");
}
