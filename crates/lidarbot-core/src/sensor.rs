//! Range sensor boundary.
//!
//! The driver itself (serial protocol, motor spin-up) lives outside this
//! crate; acquisition only sees a [`FrameSource`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{RangeFrame, RangeSample};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// A single bad read; the driver can keep going.
    #[error("transient sensor error: {0}")]
    Transient(String),
    /// The device is gone.
    #[error("sensor disconnected: {0}")]
    Disconnected(String),
}

/// Lazy, nominally endless stream of frames.
///
/// `Ok(None)` means the stream ended, which acquisition treats the same as a
/// disconnect.
pub trait FrameSource: Send {
    /// Bring the device up (spin the motor, flush stale input).
    fn start(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Option<RangeFrame>, SensorError>;

    /// Stop the device and close its handle.
    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn start(&mut self) -> Result<(), SensorError> {
        (**self).start()
    }

    fn next_frame(&mut self) -> Result<Option<RangeFrame>, SensorError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// An obstacle seen by [`SimulatedLidar`] across an angular window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimObstacle {
    pub angle_deg: f32,
    pub width_deg: f32,
    pub distance_mm: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedLidarConfig {
    pub samples_per_rev: usize,
    pub ambient_mm: f32,
    pub noise_mm: f32,
    /// Probability that a sample comes back with quality 0.
    pub dropout: f64,
    pub obstacles: Vec<SimObstacle>,
    pub frame_period_ms: u64,
    pub seed: u64,
    /// Report a disconnect after this many frames.
    pub fail_after: Option<usize>,
}

impl Default for SimulatedLidarConfig {
    fn default() -> Self {
        Self {
            samples_per_rev: 360,
            ambient_mm: 2000.0,
            noise_mm: 15.0,
            dropout: 0.05,
            obstacles: Vec::new(),
            frame_period_ms: 100,
            seed: 7,
            fail_after: None,
        }
    }
}

/// Synthetic rotating range sensor for bench runs without hardware.
#[derive(Debug)]
pub struct SimulatedLidar {
    cfg: SimulatedLidarConfig,
    rng: StdRng,
    frames: usize,
}

impl SimulatedLidar {
    pub fn new(cfg: SimulatedLidarConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, rng, frames: 0 }
    }

    fn range_at(&self, angle_deg: f32) -> f32 {
        self.cfg
            .obstacles
            .iter()
            .filter(|o| angular_distance(o.angle_deg, angle_deg) <= o.width_deg / 2.0)
            .map(|o| o.distance_mm)
            .fold(self.cfg.ambient_mm, f32::min)
    }
}

impl FrameSource for SimulatedLidar {
    fn next_frame(&mut self) -> Result<Option<RangeFrame>, SensorError> {
        if let Some(limit) = self.cfg.fail_after {
            if self.frames >= limit {
                return Err(SensorError::Disconnected("simulated unplug".into()));
            }
        }
        if self.cfg.frame_period_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.cfg.frame_period_ms));
        }
        self.frames += 1;

        let n = self.cfg.samples_per_rev.max(1);
        let step = 360.0 / n as f32;
        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            let angle = i as f32 * step + self.rng.gen_range(0.0..step.min(1.0));
            let mut distance = self.range_at(angle);
            if self.cfg.noise_mm > 0.0 {
                distance += self.rng.gen_range(-self.cfg.noise_mm..self.cfg.noise_mm);
            }
            let quality = if self.rng.gen_bool(self.cfg.dropout.clamp(0.0, 1.0)) {
                0
            } else {
                self.rng.gen_range(10..=15)
            };
            samples.push(RangeSample::new(quality, angle % 360.0, distance.max(0.0)));
        }
        Ok(Some(RangeFrame::new(samples)))
    }
}

fn angular_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Plays back a fixed list of driver results, then ends the stream.
///
/// Useful for replaying captured frames and for exercising acquisition
/// against exact error sequences.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<Result<RangeFrame, SensorError>>,
    delay: Duration,
    repeat_last: bool,
    last: Option<RangeFrame>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(script: impl IntoIterator<Item = Result<RangeFrame, SensorError>>) -> Self {
        Self { script: script.into_iter().collect(), ..Default::default() }
    }

    pub fn from_frames(frames: impl IntoIterator<Item = RangeFrame>) -> Self {
        Self::new(frames.into_iter().map(Ok))
    }

    /// Sleep before every read, like a real device between rotations.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep yielding the last frame forever instead of ending the stream.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Flag set once `release` has been called.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.released)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<RangeFrame>, SensorError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.script.pop_front() {
            Some(Ok(frame)) => {
                self.last = Some(frame.clone());
                Ok(Some(frame))
            }
            Some(Err(e)) => Err(e),
            None if self.repeat_last => Ok(self.last.clone()),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_sim(obstacles: Vec<SimObstacle>) -> SimulatedLidar {
        SimulatedLidar::new(SimulatedLidarConfig {
            noise_mm: 0.0,
            dropout: 0.0,
            frame_period_ms: 0,
            obstacles,
            ..Default::default()
        })
    }

    #[test]
    fn sim_produces_full_rotation() {
        let mut sim = quiet_sim(vec![]);
        let frame = sim.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 360);
        assert!(frame.iter().all(|s| s.is_valid() && s.distance_mm == 2000.0));
        assert!(frame.iter().all(|s| (0.0..360.0).contains(&s.angle_deg)));
    }

    #[test]
    fn sim_places_obstacles() {
        let mut sim = quiet_sim(vec![SimObstacle { angle_deg: 90.0, width_deg: 10.0, distance_mm: 150.0 }]);
        let frame = sim.next_frame().unwrap().unwrap();
        let near: Vec<_> = frame.iter().filter(|s| s.distance_mm < 200.0).collect();
        assert!(!near.is_empty());
        assert!(near.iter().all(|s| (84.0..=96.0).contains(&s.angle_deg)));
    }

    #[test]
    fn sim_same_seed_same_frames() {
        let cfg = SimulatedLidarConfig { frame_period_ms: 0, ..Default::default() };
        let a = SimulatedLidar::new(cfg.clone()).next_frame().unwrap();
        let b = SimulatedLidar::new(cfg).next_frame().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sim_disconnects_on_schedule() {
        let mut sim = SimulatedLidar::new(SimulatedLidarConfig {
            frame_period_ms: 0,
            fail_after: Some(2),
            ..Default::default()
        });
        assert!(sim.next_frame().is_ok());
        assert!(sim.next_frame().is_ok());
        assert!(matches!(sim.next_frame(), Err(SensorError::Disconnected(_))));
    }

    #[test]
    fn scripted_source_plays_then_ends() {
        let mut src = ScriptedSource::new(vec![
            Ok(RangeFrame::default()),
            Err(SensorError::Transient("crc".into())),
        ]);
        let flag = src.released_flag();
        assert_eq!(src.next_frame(), Ok(Some(RangeFrame::default())));
        assert!(src.next_frame().is_err());
        assert_eq!(src.next_frame(), Ok(None));
        src.release();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn scripted_source_can_repeat() {
        let frame = RangeFrame::new(vec![RangeSample::new(1, 0.0, 10.0)]);
        let mut src = ScriptedSource::from_frames(vec![frame.clone()]).repeating();
        for _ in 0..3 {
            assert_eq!(src.next_frame(), Ok(Some(frame.clone())));
        }
    }
}
