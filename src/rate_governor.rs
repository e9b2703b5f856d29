// ─────────────────────────────────────────────────────────────────────────────
// rate_governor.rs — rolling per-minute REST weight budget
//
// Ground truth: analyst/adapters/binance.py BinanceAdapter.add_weight. The
// timing is two-step and easy to get subtly wrong: `next_weight_reset` is
// recorded once as the next exchange-clock minute boundary (no +2s baked
// in); the +2s grace is added only when a later call computes how long to
// actually sleep.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::EngineError;

pub const DEFAULT_WEIGHT_THRESHOLD: i64 = 1150;

fn next_minute_boundary(t: DateTime<Utc>) -> DateTime<Utc> {
    let without_sub_minute = t
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    without_sub_minute + ChronoDuration::minutes(1)
}

struct GovernorState {
    current: i64,
    next_reset: Option<DateTime<Utc>>,
}

/// A fetcher for fresh exchange time + used-weight, i.e. `GET /api/v3/time`
/// with the `x-mbx-used-weight*` response headers parsed out. Abstracted so
/// tests can supply a fake clock/weight source.
#[async_trait::async_trait]
pub trait WeightSource: Send + Sync {
    async fn fetch(&self) -> Result<(DateTime<Utc>, i64), EngineError>;
}

pub struct RateGovernor<S: WeightSource> {
    threshold: i64,
    source: S,
    state: Mutex<GovernorState>,
}

impl<S: WeightSource> RateGovernor<S> {
    pub fn new(source: S, threshold: i64, initial_weight: i64) -> Self {
        RateGovernor {
            threshold,
            source,
            state: Mutex::new(GovernorState { current: initial_weight, next_reset: None }),
        }
    }

    /// Must be called before every REST request. Blocks the caller when the
    /// budget is close to exhausted.
    pub async fn reserve(&self, weight: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;

        if state.current + weight + 1 >= self.threshold && state.next_reset.is_none() {
            let (server_time, current_weight) = self.source.fetch().await?;
            state.current = current_weight;

            if state.current + weight >= self.threshold {
                state.next_reset = Some(next_minute_boundary(server_time));
            }
        } else if let Some(reset_at) = state.next_reset {
            let to_wait = reset_at - Utc::now() + ChronoDuration::seconds(2);

            state.current = 0;
            state.next_reset = None;

            if to_wait > ChronoDuration::zero() {
                // Drop the lock while sleeping so other reservations aren't
                // blocked behind us unnecessarily is *not* done here: the
                // original holds the equivalent of this lock for the whole
                // wait too, since add_weight is not reentrant.
                let millis = to_wait.num_milliseconds().max(0) as u64;
                sleep(Duration::from_millis(millis)).await;
            }
        }

        state.current += weight;

        Ok(())
    }

    pub async fn current_weight(&self) -> i64 {
        self.state.lock().await.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        server_time: DateTime<Utc>,
        weight: i64,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WeightSource for FixedSource {
        async fn fetch(&self) -> Result<(DateTime<Utc>, i64), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.server_time, self.weight))
        }
    }

    #[test]
    fn next_minute_boundary_rounds_up() {
        let t = "2026-07-28T10:15:37Z".parse::<DateTime<Utc>>().unwrap();
        let boundary = next_minute_boundary(t);
        assert_eq!(boundary.to_rfc3339(), "2026-07-28T10:16:00+00:00");
    }

    #[tokio::test]
    async fn reserve_below_threshold_does_not_refetch() {
        let source = FixedSource { server_time: Utc::now(), weight: 0, calls: AtomicUsize::new(0) };
        let gov = RateGovernor::new(source, DEFAULT_WEIGHT_THRESHOLD, 5);

        gov.reserve(2).await.unwrap();

        assert_eq!(gov.current_weight().await, 7);
        assert_eq!(gov.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reserve_near_threshold_schedules_reset_and_blocks_next_call() {
        let now = Utc::now();
        let source = FixedSource {
            server_time: now,
            weight: DEFAULT_WEIGHT_THRESHOLD,
            calls: AtomicUsize::new(0),
        };
        let gov = RateGovernor::new(source, DEFAULT_WEIGHT_THRESHOLD, DEFAULT_WEIGHT_THRESHOLD - 2);

        // current=1148, weight=2: 1148+2+1 >= 1150 -> refetch; refetched
        // weight (1150) + 2 still >= 1150 -> schedules reset ~immediately.
        gov.reserve(2).await.unwrap();
        assert_eq!(gov.source.calls.load(Ordering::SeqCst), 1);

        // Second call observes next_reset is set and blocks briefly (reset
        // is already in the past by now, so `to_wait` clamps to ~2s or less
        // after the subtraction — we only assert it resets current to 0+weight).
        gov.reserve(1).await.unwrap();
        assert_eq!(gov.current_weight().await, 1);
    }
}
