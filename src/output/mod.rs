// ============================================================================
// SECTION 11: OUTPUTS
// ============================================================================
// Sinks fed by the pipeline fan-out. A failing write is the output's own
// problem: the pool logs it and moves on to the next output. A write that
// blocks is not: there is one fan-out task, so every other output waits for
// it, and the batches produced meanwhile stay in the shared drop-oldest
// channel.
// ============================================================================

mod stream;

use std::fmt;

use async_trait::async_trait;

use crate::error::OutputResult;
use crate::metric::Metric;

pub use stream::{reconnect_delay, StreamOutput};

/// A network sink for metric batches.
#[async_trait]
pub trait Output: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Establish the connection. Called once by the pool before fan-out.
    async fn connect(&self) -> OutputResult<()>;

    async fn close(&self) -> OutputResult<()>;

    /// Deliver one batch. Runs on the pool's single fan-out task, so while
    /// this call is pending no other output receives anything. A stream
    /// output reconnecting with backoff holds the whole pool for the outage.
    async fn write_metric(&self, batch: &[Metric]) -> OutputResult<()>;

    /// Hook run after `connect` when the pool starts.
    async fn start(&self) {}

    /// Hook run when the pool stops, before it drains.
    async fn stop(&self) {}
}
