//! Regular bucketing for time, duration and numeric domains

use cubeq_expr::Interval;

/// Maps a number onto a bucket index relative to an origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bucketing {
    Numeric { origin: f64, width: f64 },
    /// Epoch-millisecond values; `origin` is a bucket start
    Calendar { origin: i64, interval: Interval },
}

impl Bucketing {
    pub fn index(&self, x: f64) -> i64 {
        match *self {
            Bucketing::Numeric { origin, width } => ((x - origin) / width).floor() as i64,
            Bucketing::Calendar { origin, interval } => match interval {
                Interval::Millis(width) => (x.floor() as i64 - origin).div_euclid(width),
                Interval::Months(_) => interval.steps_between(origin, interval.floor(x.floor() as i64)),
            },
        }
    }

    /// Inclusive lower bound of bucket `index`
    pub fn min(&self, index: i64) -> f64 {
        match *self {
            Bucketing::Numeric { origin, width } => origin + index as f64 * width,
            Bucketing::Calendar { origin, interval } => interval.step(origin, index) as f64,
        }
    }

    /// Exclusive upper bound of bucket `index`
    pub fn max(&self, index: i64) -> f64 {
        self.min(index + 1)
    }

    pub fn interval(&self) -> Option<Interval> {
        match *self {
            Bucketing::Numeric { .. } => None,
            Bucketing::Calendar { interval, .. } => Some(interval),
        }
    }
}
