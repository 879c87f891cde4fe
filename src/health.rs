//! Point-in-time health assessment.
//!
//! Assembled on demand from the network monitor, the bandwidth throttle,
//! and the engine's stuck-transfer scan. Stuck transfers are flagged, never
//! auto-cancelled.

use crate::item::{unix_timestamp, ItemId};
use crate::network::{ConnectionQuality, NetworkMonitor};
use crate::throttle::BandwidthThrottle;
use serde_json::json;
use std::collections::BTreeMap;

/// Snapshot of engine health at one instant.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub timestamp: i64,
    /// Named boolean checks; true = healthy.
    pub checks: BTreeMap<&'static str, bool>,
    pub issues: Vec<String>,
    pub details: serde_json::Value,
}

impl HealthSnapshot {
    pub fn healthy(&self) -> bool {
        self.checks.values().all(|&ok| ok)
    }
}

/// Build a health snapshot from the engine's collaborators.
pub fn snapshot(
    monitor: &NetworkMonitor,
    throttle: &BandwidthThrottle,
    stuck: &[ItemId],
) -> HealthSnapshot {
    let online = monitor.is_online();
    let quality = monitor.quality();
    let stats = throttle.stats();
    let bandwidth_ok = throttle.is_within_limits();

    let mut checks = BTreeMap::new();
    checks.insert("connectivity", online);
    checks.insert("network_quality", quality != ConnectionQuality::Poor);
    checks.insert("bandwidth_headroom", bandwidth_ok);
    checks.insert("stuck_transfers", stuck.is_empty());

    let mut issues = Vec::new();
    if !online {
        issues.push("offline".to_string());
    }
    if quality == ConnectionQuality::Poor {
        issues.push("network quality is poor".to_string());
    }
    if !bandwidth_ok {
        issues.push("bandwidth cap saturated".to_string());
    }
    if !stuck.is_empty() {
        issues.push(format!("{} transfer(s) appear stuck", stuck.len()));
    }

    HealthSnapshot {
        timestamp: unix_timestamp(),
        checks,
        issues,
        details: json!({
            "online": online,
            "quality": quality.as_str(),
            "current_rate": stats.current,
            "average_rate": stats.average,
            "peak_rate": stats.peak,
            "bandwidth_limit": stats.limit,
            "stuck_items": stuck.iter().map(|id| id.0).collect::<Vec<_>>(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LinkSignals, RetryTuning};

    #[test]
    fn all_green_when_idle_and_online() {
        let monitor = NetworkMonitor::with_seed(RetryTuning::default(), 1);
        let throttle = BandwidthThrottle::new(None, false);
        let snap = snapshot(&monitor, &throttle, &[]);
        assert!(snap.healthy());
        assert!(snap.issues.is_empty());
    }

    #[test]
    fn offline_and_stuck_items_flagged() {
        let monitor = NetworkMonitor::with_seed(RetryTuning::default(), 1);
        monitor.set_online(false);
        let throttle = BandwidthThrottle::new(None, false);
        let snap = snapshot(&monitor, &throttle, &[ItemId(4), ItemId(9)]);
        assert!(!snap.healthy());
        assert_eq!(snap.checks["connectivity"], false);
        assert_eq!(snap.checks["stuck_transfers"], false);
        assert!(snap.issues.iter().any(|i| i.contains("2 transfer")));
        assert_eq!(snap.details["stuck_items"], json!([4, 9]));
    }

    #[test]
    fn poor_quality_degrades_health() {
        let monitor = NetworkMonitor::with_seed(RetryTuning::default(), 1);
        monitor.report(LinkSignals {
            online: true,
            effective_type: Some("2g".into()),
            downlink_mbps: Some(0.1),
        });
        let throttle = BandwidthThrottle::new(None, false);
        let snap = snapshot(&monitor, &throttle, &[]);
        assert!(!snap.healthy());
        assert_eq!(snap.checks["network_quality"], false);
    }
}
