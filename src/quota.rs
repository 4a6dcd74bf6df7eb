//! Quota Notification Hook
//!
//! Storage deltas from put/delete are reported to a [`QuotaTracker`] as a
//! fire-and-forget side effect. Quota is best-effort accounting, not part of
//! the transactional guarantee of the cache contents; failures are logged
//! and dropped, never propagated.

use tracing::warn;

use crate::error::Result;

/// Receiver of storage-usage deltas for one origin
pub trait QuotaTracker: Send + Sync {
    /// Report that `origin`'s stored bytes changed by `delta_bytes`
    fn notify_delta(&self, origin: &str, delta_bytes: i64) -> Result<()>;
}

/// Tracker that discards every notification
#[derive(Debug, Default)]
pub struct NoopQuota;

impl QuotaTracker for NoopQuota {
    fn notify_delta(&self, _origin: &str, _delta_bytes: i64) -> Result<()> {
        Ok(())
    }
}

/// Deliver a delta, swallowing (but logging) any tracker failure
pub(crate) fn notify_best_effort(tracker: &dyn QuotaTracker, origin: &str, delta_bytes: i64) {
    if delta_bytes == 0 {
        return;
    }
    if let Err(e) = tracker.notify_delta(origin, delta_bytes) {
        warn!(origin, delta_bytes, error = %e, "quota notification failed");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Tracker recording every delta, for assertions
    #[derive(Default)]
    pub(crate) struct RecordingQuota {
        pub deltas: Arc<Mutex<Vec<i64>>>,
    }

    impl QuotaTracker for RecordingQuota {
        fn notify_delta(&self, _origin: &str, delta_bytes: i64) -> Result<()> {
            self.deltas.lock().push(delta_bytes);
            Ok(())
        }
    }

    struct FailingQuota;

    impl QuotaTracker for FailingQuota {
        fn notify_delta(&self, _origin: &str, _delta_bytes: i64) -> Result<()> {
            Err(crate::error::Error::storage("quota backend down"))
        }
    }

    #[test]
    fn test_recording() {
        let tracker = RecordingQuota::default();
        notify_best_effort(&tracker, "http://a", 10);
        notify_best_effort(&tracker, "http://a", -4);
        assert_eq!(*tracker.deltas.lock(), vec![10, -4]);
    }

    #[test]
    fn test_zero_delta_skipped() {
        let tracker = RecordingQuota::default();
        notify_best_effort(&tracker, "http://a", 0);
        assert!(tracker.deltas.lock().is_empty());
    }

    #[test]
    fn test_failure_is_swallowed() {
        // Must not panic or propagate.
        notify_best_effort(&FailingQuota, "http://a", 5);
    }
}
