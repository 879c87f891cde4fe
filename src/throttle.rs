//! Bandwidth throttle: rolling throughput estimate and admission gating.
//!
//! Progress deltas feed `record`; the admission loop consults
//! `is_within_limits` before starting new work. Waiting for headroom is
//! bounded polling, never an indefinite block.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of progress samples kept for the rolling average.
pub const SAMPLE_WINDOW: usize = 20;
/// Span of the "current rate" trailing window.
pub const CURRENT_WINDOW: Duration = Duration::from_secs(1);

/// Adaptive mode thresholds and step factors.
pub const ADAPT_LOW_UTILIZATION: f64 = 0.80;
pub const ADAPT_HIGH_UTILIZATION: f64 = 0.95;
pub const ADAPT_STEP_UP: f64 = 1.1;
pub const ADAPT_STEP_DOWN: f64 = 0.9;
pub const ADAPT_MAX_FACTOR: f64 = 2.0;
pub const ADAPT_MIN_FACTOR: f64 = 0.5;

/// Point-in-time throughput statistics.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleStats {
    /// Bytes/sec over the trailing second.
    pub current: f64,
    /// Bytes/sec over the whole sample window.
    pub average: f64,
    pub peak: f64,
    pub limit: Option<u64>,
    /// current / limit; 0 when uncapped.
    pub utilization: f64,
}

struct ThrottleState {
    samples: VecDeque<(Instant, u64)>,
    peak: f64,
    limit: Option<u64>,
    original_limit: Option<u64>,
    adaptive: bool,
}

/// Rate estimator and admission gate for aggregate transfer bandwidth.
pub struct BandwidthThrottle {
    state: Mutex<ThrottleState>,
}

impl BandwidthThrottle {
    pub fn new(limit: Option<u64>, adaptive: bool) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
                peak: 0.0,
                limit,
                original_limit: limit,
                adaptive,
            }),
        }
    }

    /// Record a progress delta of `bytes`.
    pub fn record(&self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    fn record_at(&self, bytes: u64, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.samples.len() == SAMPLE_WINDOW {
            state.samples.pop_front();
        }
        state.samples.push_back((now, bytes));
        let current = Self::current_of(&state, now);
        if current > state.peak {
            state.peak = current;
        }
    }

    fn current_of(state: &ThrottleState, now: Instant) -> f64 {
        let cutoff = now.checked_sub(CURRENT_WINDOW).unwrap_or(now);
        let bytes: u64 = state
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, b)| b)
            .sum();
        bytes as f64 / CURRENT_WINDOW.as_secs_f64()
    }

    /// Average over the sample window: total bytes divided by the span
    /// between the oldest and newest sample. Needs at least two samples.
    fn average_of(state: &ThrottleState) -> f64 {
        let (Some((oldest, _)), Some((newest, _))) =
            (state.samples.front(), state.samples.back())
        else {
            return 0.0;
        };
        if state.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = newest.duration_since(*oldest).as_secs_f64().max(1e-3);
        let bytes: u64 = state.samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / elapsed
    }

    pub fn current_rate(&self) -> f64 {
        let state = self.state.lock().unwrap();
        Self::current_of(&state, Instant::now())
    }

    pub fn average_rate(&self) -> f64 {
        let state = self.state.lock().unwrap();
        Self::average_of(&state)
    }

    pub fn peak_rate(&self) -> f64 {
        self.state.lock().unwrap().peak
    }

    pub fn limit(&self) -> Option<u64> {
        self.state.lock().unwrap().limit
    }

    /// True when uncapped or the current rate is under the cap.
    pub fn is_within_limits(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.limit {
            None => true,
            Some(limit) => Self::current_of(&state, Instant::now()) < limit as f64,
        }
    }

    pub fn stats(&self) -> ThrottleStats {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        let current = Self::current_of(&state, now);
        let utilization = match state.limit {
            Some(limit) if limit > 0 => current / limit as f64,
            _ => 0.0,
        };
        ThrottleStats {
            current,
            average: Self::average_of(&state),
            peak: state.peak,
            limit: state.limit,
            utilization,
        }
    }

    /// Adaptive cap adjustment, driven by a periodic timer.
    ///
    /// Sustained utilization below 80% nudges the cap up (×1.1, at most 2×
    /// the original); above 95% nudges it down (×0.9, at least 0.5×).
    pub fn maybe_adapt(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.adaptive {
            return;
        }
        let (Some(limit), Some(original)) = (state.limit, state.original_limit) else {
            return;
        };
        let avg = Self::average_of(&state);
        if avg <= 0.0 {
            return;
        }
        let utilization = avg / limit as f64;
        let next = if utilization < ADAPT_LOW_UTILIZATION {
            ((limit as f64 * ADAPT_STEP_UP).min(original as f64 * ADAPT_MAX_FACTOR)) as u64
        } else if utilization > ADAPT_HIGH_UTILIZATION {
            ((limit as f64 * ADAPT_STEP_DOWN).max(original as f64 * ADAPT_MIN_FACTOR)) as u64
        } else {
            limit
        };
        if next != limit {
            tracing::debug!(from = limit, to = next, utilization, "adaptive bandwidth cap adjusted");
            state.limit = Some(next);
        }
    }

    /// Poll for headroom at `poll` intervals, returning after at most
    /// `max_wait` regardless. Returns true if headroom was observed.
    pub async fn wait_for_headroom(&self, poll: Duration, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.is_within_limits() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncapped_is_always_within_limits() {
        let t = BandwidthThrottle::new(None, false);
        t.record(u64::MAX / 2);
        assert!(t.is_within_limits());
        assert_eq!(t.stats().utilization, 0.0);
    }

    #[test]
    fn rate_accumulates_recent_samples() {
        let t = BandwidthThrottle::new(Some(1000), false);
        t.record(300);
        t.record(300);
        let stats = t.stats();
        assert!(stats.current >= 600.0 - 1.0);
        assert!(t.is_within_limits());
        t.record(500);
        assert!(!t.is_within_limits());
        assert!(t.peak_rate() >= 1100.0 - 1.0);
    }

    #[test]
    fn sample_window_is_bounded() {
        let t = BandwidthThrottle::new(None, false);
        for _ in 0..(SAMPLE_WINDOW * 3) {
            t.record(1);
        }
        assert_eq!(t.state.lock().unwrap().samples.len(), SAMPLE_WINDOW);
    }

    /// Feed samples spaced one second apart so the average is exact.
    fn feed_spaced(t: &BandwidthThrottle, bytes_per_sec: u64, seconds: u32) {
        let start = Instant::now();
        for i in 0..=seconds {
            t.record_at(bytes_per_sec, start + Duration::from_secs(i as u64));
        }
    }

    #[test]
    fn adapt_raises_cap_on_low_utilization() {
        let t = BandwidthThrottle::new(Some(1000), true);
        // ~200 bytes/sec against a 1000 bytes/sec cap: 20% utilization.
        feed_spaced(&t, 200, 5);
        t.maybe_adapt();
        let limit = t.limit().unwrap();
        assert_eq!(limit, 1100);
        // Repeated adaptation never exceeds 2x the original cap.
        for _ in 0..50 {
            t.maybe_adapt();
        }
        assert!(t.limit().unwrap() <= 2000);
    }

    #[test]
    fn adapt_lowers_cap_on_saturation() {
        let t = BandwidthThrottle::new(Some(1000), true);
        feed_spaced(&t, 5000, 5);
        t.maybe_adapt();
        let limit = t.limit().unwrap();
        assert_eq!(limit, 900);
        for _ in 0..50 {
            t.maybe_adapt();
        }
        assert!(t.limit().unwrap() >= 500);
    }

    #[test]
    fn adapt_noop_when_disabled_or_uncapped() {
        let capped = BandwidthThrottle::new(Some(1000), false);
        capped.record(1);
        capped.maybe_adapt();
        assert_eq!(capped.limit(), Some(1000));

        let uncapped = BandwidthThrottle::new(None, true);
        uncapped.record(1);
        uncapped.maybe_adapt();
        assert_eq!(uncapped.limit(), None);
    }

    #[tokio::test]
    async fn wait_for_headroom_is_bounded() {
        let t = BandwidthThrottle::new(Some(10), false);
        t.record(1_000_000);
        let start = Instant::now();
        let ok = t
            .wait_for_headroom(Duration::from_millis(5), Duration::from_millis(30))
            .await;
        assert!(!ok);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn wait_for_headroom_returns_immediately_with_room() {
        let t = BandwidthThrottle::new(Some(1_000_000), false);
        assert!(
            t.wait_for_headroom(Duration::from_millis(5), Duration::from_millis(50))
                .await
        );
    }
}
