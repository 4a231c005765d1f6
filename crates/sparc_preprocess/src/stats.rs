//! Streaming summary statistics with an associative merge.

use sparc_protocol::Stats;

/// Count, mean, M2, min and max over a stream of samples.
///
/// Partial results from independent planes combine with [`RunningStats::merge`]
/// in any order. Any NaN sample makes every summary NaN.
#[derive(Debug, Clone, Copy)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    saw_nan: bool,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            saw_nan: false,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn push(&mut self, value: f64) {
        if value.is_nan() {
            self.saw_nan = true;
            return;
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn extend<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) {
        for &v in values {
            self.push(v);
        }
    }

    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut stats = Self::new();
        stats.extend(values);
        stats
    }

    /// Combine two partial results (Chan et al. pairwise update).
    pub fn merge(self, other: RunningStats) -> RunningStats {
        let saw_nan = self.saw_nan || other.saw_nan;
        if other.count == 0 {
            return RunningStats { saw_nan, ..self };
        }
        if self.count == 0 {
            return RunningStats { saw_nan, ..other };
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let weight = other.count as f64 / count as f64;
        RunningStats {
            count,
            mean: self.mean + delta * weight,
            m2: self.m2 + other.m2 + delta * delta * self.count as f64 * weight,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            saw_nan,
        }
    }

    /// Population statistics. Empty or NaN-tainted input yields NaN.
    pub fn finish(&self) -> Stats {
        if self.saw_nan || self.count == 0 {
            return Stats {
                mean: f64::NAN,
                std: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
            };
        }
        Stats {
            mean: self.mean,
            std: (self.m2 / self.count as f64).max(0.0).sqrt(),
            min: self.min,
            max: self.max,
        }
    }
}
