use crate::domain::RateEstimator;
use std::time::{Duration, Instant};

/// Point-in-time progress report delivered to the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub current: u64,
    /// Zero when the script has not stated a total and no hint was given.
    pub total: u64,
    pub rate: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn capture(current: u64, total: u64, estimator: &RateEstimator, now: Instant) -> Self {
        Self {
            current,
            total,
            rate: estimator.current_rate(),
            elapsed: estimator.elapsed(now),
            eta: estimator.eta(total, current),
        }
    }

    /// Fraction complete in `0.0..=1.0`, or `None` when the total is unknown.
    pub fn ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.current as f64 / self.total as f64).clamp(0.0, 1.0))
    }

    pub fn percent(&self) -> Option<u8> {
        self.ratio().map(|ratio| (ratio * 100.0).round() as u8)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.current >= self.total
    }

    /// `ep=3/10 (30%)`, or `ep=3/?` when the total is unknown.
    pub fn label(&self) -> String {
        match self.percent() {
            Some(percent) => format!("ep={}/{} ({percent}%)", self.current, self.total),
            None => format!("ep={}/?", self.current),
        }
    }

    /// `6.0 it/s • elapsed 00:02 • ETA 00:10`
    pub fn stats_line(&self) -> String {
        let rate = if self.rate > 0.0 {
            format!("{:.1} it/s", self.rate)
        } else {
            "— it/s".to_string()
        };
        let mut line = format!("{rate} • elapsed {}", format_duration(self.elapsed));
        if let Some(eta) = self.eta {
            line.push_str(" • ETA ");
            line.push_str(&format_duration(eta));
        }
        line
    }
}

/// `MM:SS`, or `HH:MM:SS` from one hour up.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
