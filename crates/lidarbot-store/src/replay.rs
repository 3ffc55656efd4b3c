use std::thread;
use std::time::Duration;

use log::info;

use lidarbot_core::{FrameSource, RangeFrame, SensorError};

use crate::error::StoreError;
use crate::store::TrainingStore;

/// Feeds recorded frames back through acquisition, in recording order.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    frames: Vec<RangeFrame>,
    cursor: usize,
    looping: bool,
    period: Duration,
}

impl ReplaySource {
    pub fn new(frames: Vec<RangeFrame>) -> Self {
        Self { frames, cursor: 0, looping: false, period: Duration::ZERO }
    }

    pub fn from_store(store: &TrainingStore) -> Result<Self, StoreError> {
        let frames: Vec<RangeFrame> = store.load_records()?.into_iter().map(|r| r.frame).collect();
        info!("replaying {} recorded frames", frames.len());
        Ok(Self::new(frames))
    }

    /// Start over after the last frame instead of ending the stream.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Pause before each frame, roughly one sensor rotation.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<RangeFrame>, SensorError> {
        if self.cursor >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(None);
            }
            self.cursor = 0;
        }
        if !self.period.is_zero() {
            thread::sleep(self.period);
        }
        let frame = self.frames[self.cursor].clone();
        self.cursor += 1;
        Ok(Some(frame))
    }
}
