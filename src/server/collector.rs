// ----------------------------------------------------------------------------
// 15.6 Collector Push Service
// ----------------------------------------------------------------------------
// Receives the metric stream of every agent in the group. Each set is logged;
// an optional sink forwards it for further processing.
// ----------------------------------------------------------------------------

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use super::Service;
use crate::wire::MetricSet;

#[derive(Debug, Default)]
pub struct CollectorService {
    sink: Option<flume::Sender<(SocketAddr, MetricSet)>>,
    received: AtomicU64,
}

impl CollectorService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every received set, tagged with the sending peer.
    pub fn with_sink(mut self, sink: flume::Sender<(SocketAddr, MetricSet)>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Service for CollectorService {
    type Request = MetricSet;
    type Response = ();

    fn name(&self) -> &'static str {
        "collector"
    }

    async fn handle(&self, set: MetricSet, peer: SocketAddr) -> Option<()> {
        self.received.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "omega::collector",
            peer = %peer,
            families = set.metric_families.len(),
            data = ?set,
            "metric"
        );
        if let Some(sink) = &self.sink {
            if sink.send_async((peer, set)).await.is_err() {
                warn!(target: "omega::collector", "Metric sink closed");
            }
        }
        None
    }
}
