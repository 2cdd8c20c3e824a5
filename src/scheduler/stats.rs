//! Pass accounting

use serde::Serialize;

/// Counters maintained by the scheduler task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    /// Passes holding a slot right now
    pub in_flight: usize,
    /// Highest `in_flight` ever observed
    pub peak_in_flight: usize,
    /// Completion signals that did not match a closed, unfinished node
    pub invariant_violations: u64,
}

impl PassStats {
    /// Passes that reached their completion callback
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    /// True when nothing is running
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    pub(crate) fn record_start(&mut self) {
        self.started += 1;
        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
    }

    pub(crate) fn record_finish(&mut self, ok: bool) {
        if ok {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_empty() {
        let stats = PassStats::default();
        assert!(stats.is_idle());
        assert_eq!(stats.finished(), 0);
    }

    #[test]
    fn test_stats_track_peak() {
        let mut stats = PassStats::default();
        stats.record_start();
        stats.record_start();
        stats.record_finish(true);
        stats.record_start();
        stats.record_finish(false);

        assert_eq!(stats.started, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.finished(), 2);
    }

    #[test]
    fn test_stats_serializable() {
        let json = serde_json::to_string(&PassStats::default()).unwrap();
        assert!(json.contains("\"peak_in_flight\":0"));
    }
}
