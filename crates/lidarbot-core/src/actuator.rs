//! Actuation boundary.
//!
//! The electrical side is a [`MotorDriver`]; the control loop only talks to an
//! [`Actuator`], which decides whether a command is a timed pulse or a held
//! drive supervised by a watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ActuatorConfig;
use crate::domain::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuationStyle {
    /// Drive for a fixed pulse, then stop, then return.
    #[default]
    Pulse,
    /// Drive until the next command; a watchdog stops stale commands.
    Continuous,
}

/// Hardware motor interface. Success or failure of the electrical call is
/// not reported back.
pub trait MotorDriver: Send {
    fn apply(&mut self, action: Action);
    fn release(&mut self) {}
}

pub trait Actuator {
    fn execute(&mut self, action: Action);
    fn release(&mut self) {}
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn execute(&mut self, action: Action) {
        (**self).execute(action)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Dry-run motor that only logs what it would do.
#[derive(Debug, Default)]
pub struct LoggingMotor {
    current: Option<Action>,
}

impl MotorDriver for LoggingMotor {
    fn apply(&mut self, action: Action) {
        if self.current != Some(action) {
            info!("motors: {}", action);
            self.current = Some(action);
        }
    }

    fn release(&mut self) {
        info!("motors released");
    }
}

#[derive(Debug)]
pub struct PulseActuator<M> {
    motor: M,
    forward_pulse: Duration,
    turn_pulse: Duration,
}

impl<M: MotorDriver> PulseActuator<M> {
    pub fn new(motor: M, forward_pulse: Duration, turn_pulse: Duration) -> Self {
        Self { motor, forward_pulse, turn_pulse }
    }

    fn pulse_for(&self, action: Action) -> Option<Duration> {
        match action {
            Action::Forward | Action::Reverse => Some(self.forward_pulse),
            Action::Left | Action::Right => Some(self.turn_pulse),
            Action::Stop => None,
        }
    }
}

impl<M: MotorDriver> Actuator for PulseActuator<M> {
    fn execute(&mut self, action: Action) {
        self.motor.apply(action);
        if let Some(pulse) = self.pulse_for(action) {
            thread::sleep(pulse);
            self.motor.apply(Action::Stop);
        }
    }

    fn release(&mut self) {
        self.motor.release();
    }
}

#[derive(Debug)]
struct Held<M> {
    motor: M,
    current: Action,
    last_command: Instant,
}

/// Holds the last command; a watchdog thread stops the motors when commands
/// stop arriving.
#[derive(Debug)]
pub struct ContinuousActuator<M: MotorDriver + 'static> {
    held: Arc<Mutex<Held<M>>>,
    stop_watchdog: Arc<AtomicBool>,
    watchdog: Option<JoinHandle<()>>,
    released: bool,
}

fn lock_held<M>(held: &Mutex<Held<M>>) -> MutexGuard<'_, Held<M>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<M: MotorDriver + 'static> ContinuousActuator<M> {
    pub fn new(motor: M, timeout: Duration) -> Self {
        let held = Arc::new(Mutex::new(Held { motor, current: Action::Stop, last_command: Instant::now() }));
        let stop_watchdog = Arc::new(AtomicBool::new(false));
        let tick = (timeout / 4).max(Duration::from_millis(1));
        let watchdog = {
            let held = Arc::clone(&held);
            let stop_watchdog = Arc::clone(&stop_watchdog);
            thread::Builder::new()
                .name("motor-watchdog".into())
                .spawn(move || {
                    while !stop_watchdog.load(Ordering::SeqCst) {
                        thread::sleep(tick);
                        let mut h = lock_held(&held);
                        if h.current != Action::Stop && h.last_command.elapsed() >= timeout {
                            warn!("no motor command for {:?}, stopping", timeout);
                            h.motor.apply(Action::Stop);
                            h.current = Action::Stop;
                        }
                    }
                })
                .map_err(|e| warn!("motor watchdog unavailable: {}", e))
                .ok()
        };
        Self { held, stop_watchdog, watchdog, released: false }
    }

    fn stop_watchdog(&mut self) {
        self.stop_watchdog.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

impl<M: MotorDriver + 'static> Actuator for ContinuousActuator<M> {
    fn execute(&mut self, action: Action) {
        let mut h = lock_held(&self.held);
        h.motor.apply(action);
        h.current = action;
        h.last_command = Instant::now();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop_watchdog();
        let mut h = lock_held(&self.held);
        h.motor.apply(Action::Stop);
        h.current = Action::Stop;
        h.motor.release();
    }
}

impl<M: MotorDriver + 'static> Drop for ContinuousActuator<M> {
    fn drop(&mut self) {
        self.stop_watchdog();
    }
}

/// Build the actuator a config asks for around `motor`.
pub fn build_actuator<M: MotorDriver + 'static>(cfg: &ActuatorConfig, motor: M) -> Box<dyn Actuator> {
    match cfg.style {
        ActuationStyle::Pulse => Box::new(PulseActuator::new(
            motor,
            Duration::from_millis(cfg.forward_pulse_ms),
            Duration::from_millis(cfg.turn_pulse_ms),
        )),
        ActuationStyle::Continuous => {
            Box::new(ContinuousActuator::new(motor, Duration::from_millis(cfg.watchdog_ms)))
        }
    }
}

/// Guarantees the robot is commanded to `Stop` and the actuator released on
/// every exit path, exactly once each.
#[derive(Debug)]
pub struct ActuatorGuard<A: Actuator> {
    inner: A,
    halted: bool,
    released: bool,
}

impl<A: Actuator> ActuatorGuard<A> {
    pub fn new(inner: A) -> Self {
        Self { inner, halted: false, released: false }
    }

    pub fn execute(&mut self, action: Action) {
        self.halted = action == Action::Stop;
        self.inner.execute(action);
    }

    /// Command `Stop` once; later calls do nothing until another action runs.
    pub fn halt(&mut self) {
        if !self.halted {
            debug!("actuator halt");
            self.inner.execute(Action::Stop);
            self.halted = true;
        }
    }

    /// Halt, then release the hardware.
    pub fn shutdown(&mut self) {
        self.halt();
        if !self.released {
            self.inner.release();
            self.released = true;
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: Actuator> Drop for ActuatorGuard<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
