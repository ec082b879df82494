// Process-wide observability counters for all drop/accept paths.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    pub location_updates: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub otp_verified: AtomicU64,
    pub otp_rejected: AtomicU64,
    pub verifications_completed: AtomicU64,
    pub emergencies_triggered: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub notification_retries: AtomicU64,
    pub events_delivered: AtomicU64,
    pub events_queued_offline: AtomicU64,
    pub offline_queue_drops: AtomicU64,
    pub access_denied: AtomicU64,
    pub rate_limited: AtomicU64,
    pub audit_entries: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            location_updates: self.location_updates.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            otp_verified: self.otp_verified.load(Ordering::Relaxed),
            otp_rejected: self.otp_rejected.load(Ordering::Relaxed),
            verifications_completed: self.verifications_completed.load(Ordering::Relaxed),
            emergencies_triggered: self.emergencies_triggered.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notification_retries: self.notification_retries.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_queued_offline: self.events_queued_offline.load(Ordering::Relaxed),
            offline_queue_drops: self.offline_queue_drops.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            audit_entries: self.audit_entries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub location_updates: u64,
    pub alerts_raised: u64,
    pub otp_verified: u64,
    pub otp_rejected: u64,
    pub verifications_completed: u64,
    pub emergencies_triggered: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notification_retries: u64,
    pub events_delivered: u64,
    pub events_queued_offline: u64,
    pub offline_queue_drops: u64,
    pub access_denied: u64,
    pub rate_limited: u64,
    pub audit_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let m = Metrics::new();
        Metrics::bump(&m.alerts_raised);
        Metrics::bump(&m.alerts_raised);
        Metrics::bump(&m.offline_queue_drops);
        let s = m.snapshot();
        assert_eq!(s.alerts_raised, 2);
        assert_eq!(s.offline_queue_drops, 1);
        assert_eq!(s.notifications_sent, 0);
    }
}
