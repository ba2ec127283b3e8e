//! Fixed-size numeric window with O(1) running sum and average.
//!
//! A single NaN or infinity folded into the running sum would stay there
//! forever and make every later `average()` comparison false, so non-finite
//! samples are refused at `push` and leave the window untouched.

use crate::RingBuffer;
use std::fmt;

/// Returned when a NaN or infinite sample is pushed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonFiniteValue(pub f64);

impl fmt::Display for NonFiniteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected non-finite sample {}", self.0)
    }
}

impl std::error::Error for NonFiniteValue {}

#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: RingBuffer<f64>,
    sum: f64,
    /// Pushes since the sum was last rebuilt from the samples
    since_resync: usize,
}

impl RollingWindow {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: RingBuffer::new(capacity),
            sum: 0.0,
            since_resync: 0,
        }
    }

    pub fn push(&mut self, value: f64) -> Result<(), NonFiniteValue> {
        if !value.is_finite() {
            return Err(NonFiniteValue(value));
        }

        if let Some(evicted) = self.samples.push_overwrite(value) {
            self.sum -= evicted;
        }
        self.sum += value;

        // Rebuild once per full turn to stop incremental rounding drift.
        self.since_resync += 1;
        if self.since_resync >= self.samples.capacity() {
            self.sum = self.samples.reduce(0.0, |acc, v| acc + v);
            self.since_resync = 0;
        }
        Ok(())
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Mean of the current samples, `None` while empty
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.samples
            .reduce(None, |acc: Option<f64>, &v| Some(acc.map_or(v, |m| m.min(v))))
    }

    pub fn max(&self) -> Option<f64> {
        self.samples
            .reduce(None, |acc: Option<f64>, &v| Some(acc.map_or(v, |m| m.max(v))))
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.since_resync = 0;
    }
}
