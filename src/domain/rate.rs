use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const MAX_RATE_SAMPLES: usize = 80;
pub const RATE_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(250);

// The time bound never trims below this many samples, otherwise a script that reports less
// often than once per window would never get a rate.
const MIN_RETAINED_SAMPLES: usize = 2;

/// Smoothed episodes-per-second estimate over a sliding window of progress samples.
#[derive(Clone, Debug)]
pub struct RateEstimator {
    samples: VecDeque<(Instant, u64)>,
    origin: Instant,
    max_samples: usize,
    window: Duration,
}

impl RateEstimator {
    pub fn new(now: Instant) -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_RATE_SAMPLES),
            origin: now,
            max_samples: MAX_RATE_SAMPLES,
            window: RATE_WINDOW,
        }
    }

    /// Clears the window and restarts the elapsed-time origin.
    pub fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.origin = now;
    }

    /// Records that `episode` was observed at `now`.
    ///
    /// Zero episodes and repeats of the most recent value are ignored; scripts commonly reprint
    /// the same counter.
    pub fn record_sample(&mut self, episode: u64, now: Instant) {
        if episode == 0 {
            return;
        }
        if self.samples.back().is_some_and(|(_, last)| *last == episode) {
            return;
        }

        self.samples.push_back((now, episode));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.samples.len() > MIN_RETAINED_SAMPLES
            && self.samples.front().is_some_and(|(at, _)| *at < cutoff)
        {
            self.samples.pop_front();
        }
    }

    /// Episodes per second between the oldest and newest retained samples.
    pub fn current_rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some((first_at, first_ep)), Some((last_at, last_ep))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let seconds = last_at.saturating_duration_since(*first_at).as_secs_f64();
        if seconds <= 0.0 || last_ep <= first_ep {
            return 0.0;
        }
        (last_ep - first_ep) as f64 / seconds
    }

    /// Estimated time until `current` reaches `total` at the current rate.
    pub fn eta(&self, total: u64, current: u64) -> Option<Duration> {
        eta_at_rate(self.current_rate(), total, current)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.origin)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub fn eta_at_rate(rate: f64, total: u64, current: u64) -> Option<Duration> {
    if rate <= 0.0 || !rate.is_finite() || total == 0 {
        return None;
    }
    let remaining = total.saturating_sub(current) as f64;
    Some(Duration::from_secs_f64(remaining / rate))
}

/// Rate-limits UI-facing snapshots. Completion snapshots bypass the interval.
#[derive(Clone, Debug)]
pub struct SnapshotThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl SnapshotThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    /// Returns whether a snapshot may be emitted at `now`, and if so marks it as emitted.
    pub fn admit(&mut self, now: Instant, force: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due || force {
            self.last_emit = Some(now);
            return true;
        }
        false
    }
}

impl Default for SnapshotThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn single_sample_has_no_rate() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(5, at(base, 1_000));
        assert_eq!(estimator.current_rate(), 0.0);
        assert_eq!(estimator.eta(100, 5), None);
    }

    #[test]
    fn repeated_episode_is_a_noop() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(3, at(base, 0));
        estimator.record_sample(3, at(base, 500));
        assert_eq!(estimator.len(), 1);
        estimator.record_sample(4, at(base, 600));
        assert_eq!(estimator.len(), 2);
    }

    #[test]
    fn zero_episode_is_ignored() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(0, base);
        assert!(estimator.is_empty());
    }

    #[test]
    fn rate_spans_the_whole_window_not_the_last_pair() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(1, at(base, 0));
        estimator.record_sample(6, at(base, 1_000));
        estimator.record_sample(13, at(base, 2_000));
        // Last pair alone would give 7.0.
        assert!((estimator.current_rate() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn eta_uses_remaining_over_rate() {
        assert_eq!(eta_at_rate(5.0, 100, 50), Some(Duration::from_secs(10)));
        assert_eq!(eta_at_rate(5.0, 100, 150), Some(Duration::ZERO));
        assert_eq!(eta_at_rate(0.0, 100, 50), None);
        assert_eq!(eta_at_rate(5.0, 0, 50), None);
    }

    #[test]
    fn window_is_bounded_by_count() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        for episode in 1..=200u64 {
            estimator.record_sample(episode, at(base, episode * 10));
        }
        assert_eq!(estimator.len(), MAX_RATE_SAMPLES);
        // 80 samples 10ms apart: 79 episodes over 0.79s.
        assert!((estimator.current_rate() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn window_is_bounded_by_age_but_keeps_two_samples() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(1, at(base, 0));
        estimator.record_sample(2, at(base, 1_000));
        estimator.record_sample(3, at(base, 11_500));
        assert_eq!(estimator.len(), 2);
        assert!((estimator.current_rate() - 1.0 / 10.5).abs() < 1e-9);

        estimator.record_sample(4, at(base, 30_000));
        assert_eq!(estimator.len(), 2);
    }

    #[test]
    fn reset_clears_samples_and_restarts_origin() {
        let base = Instant::now();
        let mut estimator = RateEstimator::new(base);
        estimator.record_sample(1, at(base, 0));
        estimator.record_sample(2, at(base, 100));
        estimator.reset(at(base, 5_000));
        assert!(estimator.is_empty());
        assert_eq!(estimator.elapsed(at(base, 6_000)), Duration::from_secs(1));
    }

    #[test]
    fn throttle_admits_at_interval_or_when_forced() {
        let base = Instant::now();
        let mut throttle = SnapshotThrottle::new(Duration::from_millis(250));
        assert!(throttle.admit(at(base, 0), false));
        assert!(!throttle.admit(at(base, 100), false));
        assert!(throttle.admit(at(base, 120), true));
        assert!(!throttle.admit(at(base, 300), false));
        assert!(throttle.admit(at(base, 370), false));
    }
}
