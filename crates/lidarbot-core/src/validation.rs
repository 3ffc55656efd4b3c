//! Input validation for raw sensor frames.

use serde::{Deserialize, Serialize};

use crate::domain::RangeFrame;

/// Where low-quality samples are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStage {
    /// Acquisition filters before publishing.
    #[default]
    Producer,
    /// Frames are published raw and the consumer filters its snapshot.
    Consumer,
}

/// Drop samples with zero quality or a non-positive range.
pub fn filter_frame(frame: RangeFrame) -> RangeFrame {
    if frame.samples.iter().all(|s| s.is_valid()) {
        return frame;
    }
    frame.retain_valid()
}

/// Trips after `threshold` consecutive failures; any success resets it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    last_failure_us: Option<i64>,
    threshold: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self { failure_count: 0, last_failure_us: None, threshold: threshold.max(1) }
    }

    pub fn trip(&mut self, now_us: i64) {
        self.failure_count += 1;
        self.last_failure_us = Some(now_us);
    }

    pub fn allow(&self) -> bool {
        self.failure_count < self.threshold
    }

    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.last_failure_us = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_us(&self) -> Option<i64> {
        self.last_failure_us
    }
}
