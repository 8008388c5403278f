//! Throughput, ETA and percentage derived from a task's byte counter.
//!
//! The tracker keeps `(instant, transferred)` samples inside a sliding window;
//! speed is the slope across the window. Bytes that were already present when
//! a task resumed form the baseline: they count toward progress but never
//! toward speed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Direction, TaskState};

/// Point-in-time view of a task's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Task identifier
    pub task_id: String,
    /// Transfer direction
    pub direction: Direction,
    /// Current lifecycle state
    pub state: TaskState,
    /// Bytes covered so far
    pub transferred: u64,
    /// Total bytes of the task
    pub total: u64,
    /// Integer percentage, 100 only at full coverage
    pub progress: u8,
    /// Bytes per second over the sliding window
    pub speed: u64,
    /// Seconds remaining, absent while speed is zero
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    /// Speed formatted for humans, e.g. `"1.5 MB/s"`
    pub speed_human: String,
    /// ETA formatted for humans, e.g. `"2m 5s"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_human: Option<String>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Integer percentage that only reaches 100 when `transferred == total`.
#[must_use]
pub fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = u128::from(transferred.min(total)) * 100 / u128::from(total);
    pct as u8
}

/// Sliding-window progress tracker for one task.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    baseline: u64,
    transferred: u64,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    peak_speed: u64,
    started_at: Instant,
    updated_at: DateTime<Utc>,
}

impl ProgressTracker {
    /// Create a tracker for `total` bytes, `baseline` of which are already present.
    #[must_use]
    pub fn new(total: u64, baseline: u64, window: Duration) -> Self {
        Self::starting_at(Instant::now(), total, baseline, window)
    }

    /// Like [`ProgressTracker::new`] with an explicit start instant.
    #[must_use]
    pub fn starting_at(now: Instant, total: u64, baseline: u64, window: Duration) -> Self {
        let baseline = baseline.min(total);
        let mut samples = VecDeque::new();
        samples.push_back((now, baseline));
        Self {
            total,
            baseline,
            transferred: baseline,
            window,
            samples,
            peak_speed: 0,
            started_at: now,
            updated_at: Utc::now(),
        }
    }

    /// Record the new cumulative byte count.
    pub fn record(&mut self, transferred: u64) {
        self.record_at(Instant::now(), transferred);
    }

    /// Record the new cumulative byte count observed at `now`.
    pub fn record_at(&mut self, now: Instant, transferred: u64) {
        self.transferred = transferred.min(self.total);
        self.samples.push_back((now, self.transferred));
        self.prune(now);
        self.peak_speed = self.peak_speed.max(self.speed_at(now));
        self.updated_at = Utc::now();
    }

    fn prune(&mut self, now: Instant) {
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(&(t, _)) if now.saturating_duration_since(t) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Bytes per second across the window ending at `now`.
    #[must_use]
    pub fn speed_at(&self, now: Instant) -> u64 {
        let (Some(&(first_t, first_b)), Some(&(last_t, last_b))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };

        if now.saturating_duration_since(last_t) > self.window {
            return 0;
        }

        let elapsed = last_t.saturating_duration_since(first_t).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0;
        }
        (last_b.saturating_sub(first_b) as f64 / elapsed) as u64
    }

    /// Current speed in bytes per second.
    #[must_use]
    pub fn speed(&self) -> u64 {
        self.speed_at(Instant::now())
    }

    /// Estimated seconds remaining at `now`, `None` while nothing moves.
    #[must_use]
    pub fn eta_at(&self, now: Instant) -> Option<u64> {
        let speed = self.speed_at(now);
        if speed == 0 {
            return None;
        }
        Some((self.total - self.transferred).div_ceil(speed))
    }

    /// Cumulative bytes.
    #[must_use]
    pub const fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Total bytes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Bytes present before this run started.
    #[must_use]
    pub const fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Highest windowed speed seen so far.
    #[must_use]
    pub const fn peak_speed(&self) -> u64 {
        self.peak_speed
    }

    /// Time since the tracker started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Bytes moved in this run divided by the run's duration.
    #[must_use]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0;
        }
        ((self.transferred - self.baseline) as f64 / secs) as u64
    }

    /// Build a snapshot for publication.
    #[must_use]
    pub fn snapshot(&self, task_id: &str, direction: Direction, state: TaskState) -> ProgressSnapshot {
        let now = Instant::now();
        let speed = if state == TaskState::Active {
            self.speed_at(now)
        } else {
            0
        };
        let eta = if state == TaskState::Active {
            self.eta_at(now)
        } else {
            None
        };

        ProgressSnapshot {
            task_id: task_id.to_string(),
            direction,
            state,
            transferred: self.transferred,
            total: self.total,
            progress: percent(self.transferred, self.total),
            speed,
            eta,
            speed_human: format_speed(speed),
            eta_human: eta.map(|secs| format_duration(Duration::from_secs(secs))),
            updated_at: self.updated_at,
        }
    }
}

/// Format a byte count, e.g. `"1.5 MB"`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format a speed, e.g. `"1.5 MB/s"`.
#[must_use]
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Format a duration as `"1h 2m 3s"`, dropping leading zero units.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, mins, secs) = (total / 3600, (total % 3600) / 60, total % 60);

    if hours > 0 {
        format!("{hours}h {mins}m {secs}s")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(5);

    #[test]
    fn test_percent_floors_until_complete() {
        assert_eq!(percent(0, 100), 0);
        assert_eq!(percent(999, 1000), 99);
        assert_eq!(percent(1000, 1000), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(u64::MAX - 1, u64::MAX), 99);
    }

    #[test]
    fn test_speed_over_window() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(start, 10_000, 0, WINDOW);

        tracker.record_at(start + Duration::from_secs(1), 1000);
        tracker.record_at(start + Duration::from_secs(2), 2000);

        assert_eq!(tracker.speed_at(start + Duration::from_secs(2)), 1000);
        assert_eq!(tracker.eta_at(start + Duration::from_secs(2)), Some(8));
        assert_eq!(tracker.peak_speed(), 1000);
    }

    #[test]
    fn test_old_samples_fall_out_of_window() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(start, 1_000_000, 0, WINDOW);

        tracker.record_at(start + Duration::from_secs(1), 100_000);
        tracker.record_at(start + Duration::from_secs(10), 110_000);
        tracker.record_at(start + Duration::from_secs(11), 120_000);

        assert_eq!(tracker.speed_at(start + Duration::from_secs(11)), 10_000);
        assert!(tracker.peak_speed() >= 10_000);
    }

    #[test]
    fn test_idle_tracker_has_no_eta() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(start, 1000, 0, WINDOW);
        assert_eq!(tracker.speed_at(start), 0);
        assert_eq!(tracker.eta_at(start), None);

        tracker.record_at(start + Duration::from_secs(1), 500);
        assert_eq!(tracker.speed_at(start + Duration::from_secs(60)), 0);
        assert_eq!(tracker.eta_at(start + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_baseline_counts_for_progress_not_speed() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(start, 5 * 1024 * 1024, 2_097_152, WINDOW);

        assert_eq!(tracker.transferred(), 2_097_152);
        let snapshot = tracker.snapshot("t", Direction::Download, TaskState::Active);
        assert_eq!(snapshot.transferred, 2_097_152);
        assert_eq!(snapshot.progress, 40);
        assert_eq!(snapshot.speed, 0);

        tracker.record_at(start + Duration::from_secs(1), 2_097_152 + 1000);
        assert_eq!(tracker.speed_at(start + Duration::from_secs(1)), 1000);
    }

    #[test]
    fn test_snapshot_of_finished_task_has_no_speed() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::starting_at(start, 100, 0, WINDOW);
        tracker.record_at(start + Duration::from_millis(10), 100);

        let snapshot = tracker.snapshot("t", Direction::Upload, TaskState::Completed);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.speed, 0);
        assert!(snapshot.eta.is_none());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_speed(3 * 1024 * 1024), "3.0 MB/s");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }
}
