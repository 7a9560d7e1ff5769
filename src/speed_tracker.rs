//! Progress and speed tracking for multi-unit work
//!
//! A [`SpeedTracker`] counts completed units against a known total and owns an
//! optional nested tracker for the sub-units of the unit currently in flight.
//! The nested tracker contributes a fractional percentage to the overall
//! progress, so the bar keeps moving while a single long unit downloads.

use std::sync::RwLock;
use std::time::Instant;

/// Tracks progress and speed for work items
///
/// Safe for concurrent reads (`progress`, `speed`) and writes (`increment*`)
/// from different tasks. Progress is monotonically non-decreasing across any
/// sequence of `increment`, `set_intermediate`, `increment_intermediate` and
/// `clear_intermediate` calls: banked whole-unit progress is never reduced.
pub struct SpeedTracker {
    max: usize,
    start: Instant,
    completed: RwLock<usize>,
    /// Tracks sub-unit progress of the current work item
    intermediate: RwLock<Option<Box<SpeedTracker>>>,
}

impl SpeedTracker {
    /// Create a new tracker expecting `max` units of work
    pub fn new(max: usize) -> Self {
        Self {
            max,
            start: Instant::now(),
            completed: RwLock::new(0),
            intermediate: RwLock::new(None),
        }
    }

    /// Record that one unit of work finished.
    ///
    /// Silently does nothing once `max` units have completed; the tracker can
    /// never report more than 100%.
    pub fn increment(&self) {
        if let Ok(mut completed) = self.completed.write() {
            if *completed < self.max {
                *completed += 1;
            }
        }
    }

    /// Increment the intermediate tracker, if one is set
    pub fn increment_intermediate(&self) {
        if let Ok(guard) = self.intermediate.read() {
            if let Some(inner) = guard.as_ref() {
                inner.increment();
            }
        }
    }

    /// Start tracking sub-progress of the current unit with `max` sub-units
    pub fn set_intermediate(&self, max: usize) {
        if let Ok(mut guard) = self.intermediate.write() {
            *guard = Some(Box::new(SpeedTracker::new(max)));
        }
    }

    /// Discard the intermediate tracker (call when the current unit completes)
    pub fn clear_intermediate(&self) {
        if let Ok(mut guard) = self.intermediate.write() {
            *guard = None;
        }
    }

    /// Completion percentage in [0, 100].
    ///
    /// When an intermediate tracker is set, its own progress contributes
    /// `intermediate / max` percent — partial progress on the current unit
    /// shows up as a sub-percentage of the overall bar.
    pub fn progress(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }

        let completed = self.completed.read().map(|c| *c).unwrap_or(0);

        let intermediate = self
            .intermediate
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|inner| inner.progress()))
            .unwrap_or(0.0);

        (completed as f64 / self.max as f64) * 100.0 + intermediate / self.max as f64
    }

    /// Completed units per second since the tracker was created
    pub fn speed(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        let completed = self.completed.read().map(|c| *c).unwrap_or(0);
        completed as f64 / elapsed
    }

    /// Sub-units per second of the current unit, if one is being tracked
    pub fn intermediate_speed(&self) -> f64 {
        self.intermediate
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|inner| inner.speed()))
            .unwrap_or(0.0)
    }

    /// Estimated seconds until all units complete, when the speed is known
    pub fn eta_seconds(&self) -> Option<u64> {
        let completed = self.completed.read().map(|c| *c).unwrap_or(0);
        if completed == 0 {
            return None;
        }
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        Some(((self.max - completed) as f64 / speed).ceil() as u64)
    }

    /// The total number of units this tracker expects
    pub fn total(&self) -> usize {
        self.max
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    // --- exact progress values ---

    #[test]
    fn progress_without_intermediate_is_completed_over_max() {
        let tracker = SpeedTracker::new(10);
        for _ in 0..5 {
            tracker.increment();
        }
        assert_eq!(tracker.progress(), 50.0);
    }

    #[test]
    fn intermediate_contributes_a_sub_percentage() {
        let tracker = SpeedTracker::new(10);
        tracker.set_intermediate(100);

        for _ in 0..50 {
            tracker.increment_intermediate();
        }
        assert_eq!(
            tracker.progress(),
            5.0,
            "half of one unit out of ten is 5 percent"
        );

        for _ in 0..50 {
            tracker.increment_intermediate();
        }
        assert_eq!(
            tracker.progress(),
            10.0,
            "a fully complete intermediate equals one whole unit"
        );
    }

    #[test]
    fn progress_with_zero_max_is_zero() {
        let tracker = SpeedTracker::new(0);
        tracker.increment();
        assert_eq!(tracker.progress(), 0.0);
    }

    // --- monotonicity ---

    #[test]
    fn progress_never_decreases_across_unit_boundaries() {
        let tracker = SpeedTracker::new(4);
        let mut last = tracker.progress();

        for _ in 0..4 {
            tracker.set_intermediate(3);
            last = assert_non_decreasing(&tracker, last);

            for _ in 0..3 {
                tracker.increment_intermediate();
                last = assert_non_decreasing(&tracker, last);
            }

            // Banking the unit and dropping the intermediate must not dip:
            // increment first, then clear.
            tracker.increment();
            tracker.clear_intermediate();
            last = assert_non_decreasing(&tracker, last);
        }

        assert_eq!(tracker.progress(), 100.0);
    }

    #[test]
    fn increment_saturates_at_max() {
        let tracker = SpeedTracker::new(2);
        for _ in 0..10 {
            tracker.increment();
        }
        assert_eq!(
            tracker.progress(),
            100.0,
            "extra increments past max must be silent no-ops"
        );
    }

    #[test]
    fn clear_intermediate_without_set_is_harmless() {
        let tracker = SpeedTracker::new(3);
        tracker.clear_intermediate();
        tracker.increment_intermediate();
        assert_eq!(tracker.progress(), 0.0);
    }

    // --- speed / eta ---

    #[test]
    fn speed_is_zero_before_any_completion() {
        let tracker = SpeedTracker::new(5);
        assert_eq!(tracker.speed(), 0.0);
        assert_eq!(tracker.eta_seconds(), None, "no eta without a sample");
    }

    #[test]
    fn eta_shrinks_as_units_complete() {
        let tracker = SpeedTracker::new(100);
        tracker.increment();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let eta = tracker.eta_seconds();
        assert!(eta.is_some(), "one completed unit is enough for an estimate");
    }

    // --- concurrency ---

    #[test]
    fn concurrent_increments_are_counted_and_bounded() {
        use std::sync::Arc;

        let tracker = Arc::new(SpeedTracker::new(100));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        tracker.increment();
                        let p = tracker.progress();
                        assert!((0.0..=100.0).contains(&p));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.progress(), 100.0);
    }

    fn assert_non_decreasing(tracker: &SpeedTracker, last: f64) -> f64 {
        let now = tracker.progress();
        assert!(
            now >= last,
            "progress decreased from {last} to {now}"
        );
        now
    }
}
