//! Connectivity and link-quality monitor, retry decision and backoff delay.
//!
//! The host's connectivity probe feeds `report`; the engine consults
//! `should_retry`/`retry_delay` on transfer errors and subscribes to
//! online/offline transitions to pause and resume itself.

use crate::error::TransferErrorKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Classified link quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Unknown,
}

impl ConnectionQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Unknown => "unknown",
        }
    }

    /// Backoff scaling: retry slower on poor links, faster on excellent ones.
    pub fn delay_factor(self) -> f64 {
        match self {
            ConnectionQuality::Poor => 2.0,
            ConnectionQuality::Good => 1.2,
            ConnectionQuality::Excellent => 0.8,
            ConnectionQuality::Unknown => 1.0,
        }
    }
}

/// Raw signals from the host's connectivity probe.
#[derive(Debug, Clone, Default)]
pub struct LinkSignals {
    pub online: bool,
    /// Effective connection class where available ("4g", "3g", ...).
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
}

/// Classify raw probe signals into a quality bucket.
pub fn classify(signals: &LinkSignals) -> ConnectionQuality {
    if !signals.online {
        return ConnectionQuality::Poor;
    }
    let et = signals.effective_type.as_deref();
    match (et, signals.downlink_mbps) {
        (Some("4g"), Some(d)) if d >= 5.0 => ConnectionQuality::Excellent,
        (Some("4g"), _) => ConnectionQuality::Good,
        (Some("3g") | Some("2g") | Some("slow-2g"), _) => ConnectionQuality::Poor,
        (_, Some(d)) if d >= 5.0 => ConnectionQuality::Excellent,
        (_, Some(d)) if d >= 2.0 => ConnectionQuality::Good,
        (_, Some(_)) => ConnectionQuality::Poor,
        (None, None) | (Some(_), None) => ConnectionQuality::Unknown,
    }
}

/// Retry policy parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryTuning {
    /// Maximum retry attempts per item (0 = never retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on the computed delay, jitter included.
    pub max_delay: Duration,
    /// Jitter as a fraction of the scaled delay, in [0, 1]. 0 disables it.
    pub jitter_fraction: f64,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.25,
        }
    }
}

struct MonitorState {
    online: bool,
    quality: ConnectionQuality,
}

/// Tracks connectivity and quality; decides whether and when to retry.
pub struct NetworkMonitor {
    tuning: RetryTuning,
    state: Mutex<MonitorState>,
    rng: Mutex<StdRng>,
    online_tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(tuning: RetryTuning) -> Self {
        Self::with_seed(tuning, rand::random())
    }

    /// Fixed RNG seed makes jitter, and thus delays, fully deterministic.
    pub fn with_seed(tuning: RetryTuning, seed: u64) -> Self {
        let (online_tx, _) = watch::channel(true);
        Self {
            tuning,
            state: Mutex::new(MonitorState {
                online: true,
                quality: ConnectionQuality::Unknown,
            }),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            online_tx,
        }
    }

    /// Feed a probe reading; emits an online/offline transition if it changed.
    pub fn report(&self, signals: LinkSignals) {
        let quality = classify(&signals);
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.online != signals.online;
            state.online = signals.online;
            state.quality = quality;
            changed
        };
        if changed {
            tracing::info!(online = signals.online, quality = quality.as_str(), "connectivity changed");
            let _ = self.online_tx.send(signals.online);
        }
    }

    /// Convenience for hosts that only track online/offline.
    pub fn set_online(&self, online: bool) {
        let quality = self.quality();
        self.report(LinkSignals {
            online,
            effective_type: None,
            downlink_mbps: None,
        });
        // report() reclassifies from empty signals; keep the last known
        // quality while online so a bare transition doesn't erase it.
        if online {
            self.state.lock().unwrap().quality = quality;
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    pub fn quality(&self) -> ConnectionQuality {
        self.state.lock().unwrap().quality
    }

    /// Online/offline transitions; the engine pauses on `false`, resumes on `true`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Whether another attempt is justified for an error of `kind` after
    /// `attempts` tries.
    pub fn should_retry(&self, attempts: u32, kind: TransferErrorKind) -> bool {
        if attempts >= self.tuning.max_attempts {
            return false;
        }
        if !self.is_online() {
            return false;
        }
        match kind.is_retryable() {
            Some(retryable) => retryable,
            None => matches!(
                self.quality(),
                ConnectionQuality::Good | ConnectionQuality::Excellent
            ),
        }
    }

    /// Exponential backoff scaled by link quality plus bounded jitter,
    /// capped at `max_delay`. Non-decreasing in `attempts` when jitter is 0.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = 1u64 << attempts.min(16);
        let base_ms = self.tuning.base_delay.as_millis() as f64;
        let scaled = base_ms * exp as f64 * self.quality().delay_factor();
        let jitter = if self.tuning.jitter_fraction > 0.0 {
            let unit: f64 = self.rng.lock().unwrap().gen();
            unit * self.tuning.jitter_fraction * scaled
        } else {
            0.0
        };
        let total = Duration::from_millis((scaled + jitter) as u64);
        total.min(self.tuning.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning_no_jitter() -> RetryTuning {
        RetryTuning {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn classify_buckets() {
        let sig = |online, et: Option<&str>, dl| LinkSignals {
            online,
            effective_type: et.map(String::from),
            downlink_mbps: dl,
        };
        assert_eq!(classify(&sig(false, None, None)), ConnectionQuality::Poor);
        assert_eq!(
            classify(&sig(true, Some("4g"), Some(10.0))),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            classify(&sig(true, Some("4g"), Some(3.0))),
            ConnectionQuality::Good
        );
        assert_eq!(
            classify(&sig(true, Some("3g"), Some(1.0))),
            ConnectionQuality::Poor
        );
        assert_eq!(
            classify(&sig(true, None, Some(1.0))),
            ConnectionQuality::Poor
        );
        assert_eq!(classify(&sig(true, None, None)), ConnectionQuality::Unknown);
    }

    #[test]
    fn no_retry_past_max_attempts() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        assert!(m.should_retry(0, TransferErrorKind::Timeout));
        assert!(m.should_retry(2, TransferErrorKind::Timeout));
        assert!(!m.should_retry(3, TransferErrorKind::Timeout));
    }

    #[test]
    fn no_retry_while_offline() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        m.set_online(false);
        assert!(!m.should_retry(0, TransferErrorKind::Timeout));
    }

    #[test]
    fn no_retry_for_permanent_errors() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        assert!(!m.should_retry(0, TransferErrorKind::PermissionDenied));
        assert!(!m.should_retry(0, TransferErrorKind::QuotaExceeded));
    }

    #[test]
    fn unknown_errors_retry_only_on_good_links() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        assert!(!m.should_retry(0, TransferErrorKind::Unknown));
        m.report(LinkSignals {
            online: true,
            effective_type: Some("4g".into()),
            downlink_mbps: Some(10.0),
        });
        assert!(m.should_retry(0, TransferErrorKind::Unknown));
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        let d0 = m.retry_delay(0);
        let d1 = m.retry_delay(1);
        let d2 = m.retry_delay(2);
        assert!(d1 >= d0);
        assert!(d2 >= d1);
        assert_eq!(d0, Duration::from_millis(100));
        assert!(m.retry_delay(30) <= Duration::from_secs(10));
    }

    #[test]
    fn quality_scales_delay() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        m.report(LinkSignals {
            online: true,
            effective_type: Some("3g".into()),
            downlink_mbps: Some(0.5),
        });
        // Poor quality doubles the backoff.
        assert_eq!(m.retry_delay(0), Duration::from_millis(200));
        m.report(LinkSignals {
            online: true,
            effective_type: Some("4g".into()),
            downlink_mbps: Some(10.0),
        });
        assert_eq!(m.retry_delay(0), Duration::from_millis(80));
    }

    #[test]
    fn jitter_is_deterministic_under_fixed_seed() {
        let t = RetryTuning {
            jitter_fraction: 0.25,
            ..tuning_no_jitter()
        };
        let a = NetworkMonitor::with_seed(t, 42);
        let b = NetworkMonitor::with_seed(t, 42);
        for attempts in 0..5 {
            assert_eq!(a.retry_delay(attempts), b.retry_delay(attempts));
        }
    }

    #[test]
    fn offline_transition_is_published() {
        let m = NetworkMonitor::with_seed(tuning_no_jitter(), 7);
        let rx = m.subscribe();
        m.set_online(false);
        assert!(!*rx.borrow());
        m.set_online(true);
        assert!(*rx.borrow());
    }
}
