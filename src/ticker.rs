// ============================================================================
// SECTION 7: ALIGNED TICKER
// ============================================================================
// Drives plugin gathering on wall-clock boundaries: with a 60s interval the
// ticks land on :00 of every minute (plus a fixed offset and a random
// jitter). A slow consumer misses ticks; ticks are never queued.
// ============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A source of periodic ticks.
pub trait Ticker: Send + Sync {
    /// Channel yielding the time of each tick; closes after `stop`.
    fn elapsed(&self) -> flume::Receiver<DateTime<Utc>>;

    /// Stop ticking.
    fn stop(&self);
}

/// Ticker aligned to multiples of `interval` since the Unix epoch.
#[derive(Debug)]
pub struct AlignedTicker {
    rx: flume::Receiver<DateTime<Utc>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AlignedTicker {
    /// Spawn a ticker on the current runtime.
    pub fn new(interval: Duration, jitter: Duration, offset: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let (tx, rx) = flume::bounded(1);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut delay = next_delay(Utc::now(), interval, jitter, offset);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        let now = Utc::now();
                        if tx.try_send(now).is_err() {
                            trace!(target: "omega::ticker", "tick skipped, consumer busy");
                        }
                        delay = next_delay(now, interval, jitter, offset);
                    }
                }
            }
        });

        Self { rx, cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Ticker for AlignedTicker {
    fn elapsed(&self) -> flume::Receiver<DateTime<Utc>> {
        self.rx.clone()
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AlignedTicker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// First multiple of `interval` at or after `t`.
pub fn align_time(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = duration_nanos(interval).max(1);
    let nanos = t.timestamp_nanos_opt().unwrap_or_default();
    let rem = nanos.rem_euclid(step);
    if rem == 0 {
        t
    } else {
        t + chrono::Duration::nanoseconds(step - rem)
    }
}

/// Delay from `now` until the next aligned tick, before jitter.
///
/// A minimum gap of `interval / 100` keeps a tick that fired slightly early
/// from scheduling an almost-zero follow-up.
pub fn next_aligned(now: DateTime<Utc>, interval: Duration, offset: Duration) -> Duration {
    let min_gap = interval / 100;
    let earliest = now + chrono::Duration::nanoseconds(duration_nanos(min_gap));
    let next = align_time(earliest, interval);
    let mut delay = (next - now).to_std().unwrap_or(Duration::ZERO);
    if delay.is_zero() {
        delay = interval;
    }
    delay + offset
}

fn next_delay(now: DateTime<Utc>, interval: Duration, jitter: Duration, offset: Duration) -> Duration {
    next_aligned(now, interval, offset) + random_duration(jitter)
}

/// Uniform random duration in `[0, max)`.
pub fn random_duration(max: Duration) -> Duration {
    let nanos = max.as_nanos() as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_align_time() {
        let interval = Duration::from_secs(10);
        assert_eq!(align_time(at_millis(20_000), interval), at_millis(20_000));
        assert_eq!(align_time(at_millis(20_001), interval), at_millis(30_000));
        assert_eq!(align_time(at_millis(29_999), interval), at_millis(30_000));
    }

    #[test]
    fn test_next_aligned_delay() {
        let interval = Duration::from_secs(10);
        assert_eq!(next_aligned(at_millis(3_000), interval, Duration::ZERO), Duration::from_secs(7));
        // Exactly on a boundary: wait a full interval.
        assert_eq!(next_aligned(at_millis(10_000), interval, Duration::ZERO), Duration::from_secs(10));
        // Within the minimum gap of the boundary: skip to the following one.
        assert_eq!(
            next_aligned(at_millis(19_950), interval, Duration::ZERO),
            Duration::from_millis(10_050)
        );
        assert_eq!(
            next_aligned(at_millis(3_000), interval, Duration::from_secs(1)),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn test_random_duration_bounds() {
        assert_eq!(random_duration(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_duration(Duration::from_millis(5)) < Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn test_ticker_ticks_and_stops() {
        let ticker = AlignedTicker::new(Duration::from_millis(20), Duration::ZERO, Duration::ZERO);
        let rx = ticker.elapsed();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("tick in time")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("tick in time")
            .unwrap();
        assert!(second > first);

        ticker.stop();
        // Drain a tick that may already be buffered, then the channel closes.
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv_async().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    proptest! {
        #[test]
        fn prop_next_tick_is_aligned(now_ms in 0i64..4_000_000_000_000, secs in 1u64..3600) {
            let interval = Duration::from_secs(secs);
            let now = at_millis(now_ms);
            let delay = next_aligned(now, interval, Duration::ZERO);
            prop_assert!(delay > Duration::ZERO);
            prop_assert!(delay <= interval + interval / 100);
            let tick = now + chrono::Duration::from_std(delay).unwrap();
            prop_assert_eq!(tick.timestamp_nanos_opt().unwrap() % (secs as i64 * 1_000_000_000), 0);
        }
    }
}
