use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::acquisition::{
    AcquisitionExit, AcquisitionOptions, AcquisitionReport, ProducerWatch, ScanAcquisitionTask,
};
use crate::actuator::{Actuator, ActuatorGuard};
use crate::buffer::SharedScanBuffer;
use crate::config::{ControlConfig, RoverConfig};
use crate::cooldown::CooldownGate;
use crate::domain::Action;
use crate::policy::DecisionEngine;
use crate::recorder::{FrameRecorder, RecordOutcome};
use crate::sensor::FrameSource;
use crate::shutdown::StopSignal;

#[derive(Debug, Error)]
pub enum ControlError {
    /// No fresh frames and the producer has exited. `exit` says why the
    /// producer stopped; `Session::run` fills it in after the join.
    #[error(
        "range sensor lost: no fresh frames and acquisition has exited{}",
        .exit.as_ref().map(|e| format!(" ({e})")).unwrap_or_default()
    )]
    SensorLost { exit: Option<AcquisitionExit> },
    #[error("failed to start acquisition: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("input failed: {0}")]
    Input(String),
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub idle_delay: Duration,
    pub staleness: Duration,
    pub producer_join_timeout: Duration,
    pub record_autonomous: bool,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self::from(&ControlConfig::default())
    }
}

impl From<&ControlConfig> for ControlOptions {
    fn from(cfg: &ControlConfig) -> Self {
        Self {
            idle_delay: Duration::from_millis(cfg.idle_delay_ms),
            staleness: Duration::from_millis(cfg.staleness_ms),
            producer_join_timeout: Duration::from_millis(cfg.producer_join_timeout_ms),
            record_autonomous: cfg.record_autonomous,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub ticks: u64,
    pub decisions: u64,
    /// Decisions replaced by the previous action inside the cooldown.
    pub suppressed: u64,
    /// Times the executed action differed from the one before.
    pub action_changes: u64,
    pub idle_ticks: u64,
    pub stale_ticks: u64,
    pub records_written: u64,
}

/// What a consumer gets while a session is running.
pub struct SessionContext<'a, A: Actuator> {
    pub buffer: &'a SharedScanBuffer,
    pub stop: &'a StopSignal,
    pub producer: ProducerWatch,
    pub actuator: &'a mut ActuatorGuard<A>,
}

#[derive(Debug)]
pub struct SessionReport<T> {
    pub consumer: T,
    /// `None` if the producer did not exit within the join timeout.
    pub acquisition: Option<AcquisitionReport>,
}

/// Runs one producer and one consumer and owns the shutdown order.
#[derive(Debug, Clone)]
pub struct Session {
    buffer: Arc<SharedScanBuffer>,
    stop: StopSignal,
    acquisition: AcquisitionOptions,
    join_timeout: Duration,
}

impl Session {
    pub fn new(stop: StopSignal, acquisition: AcquisitionOptions, join_timeout: Duration) -> Self {
        Self { buffer: Arc::new(SharedScanBuffer::new()), stop, acquisition, join_timeout }
    }

    pub fn from_config(cfg: &RoverConfig, stop: StopSignal) -> Self {
        Self::new(
            stop,
            AcquisitionOptions::from(&cfg.sensor),
            Duration::from_millis(cfg.control.producer_join_timeout_ms),
        )
    }

    pub fn buffer(&self) -> &Arc<SharedScanBuffer> {
        &self.buffer
    }

    /// Start acquisition, run `consumer` on the calling thread, then shut down:
    /// raise stop, wait for the producer, command `Stop`, release the sensor,
    /// release the actuator. The shutdown runs whatever the consumer returns.
    pub fn run<S, A, T, F>(
        &self,
        source: S,
        actuator: A,
        consumer: F,
    ) -> Result<SessionReport<T>, ControlError>
    where
        S: FrameSource + 'static,
        A: Actuator,
        F: FnOnce(&mut SessionContext<'_, A>) -> Result<T, ControlError>,
    {
        let mut teardown = Teardown {
            stop: self.stop.clone(),
            task: None,
            actuator: ActuatorGuard::new(actuator),
            join_timeout: self.join_timeout,
            done: false,
        };
        let task = ScanAcquisitionTask::spawn(
            source,
            Arc::clone(&self.buffer),
            self.stop.clone(),
            self.acquisition.clone(),
        )?;
        let producer = task.watch();
        teardown.task = Some(task);
        info!("session started");

        let result = {
            let mut ctx = SessionContext {
                buffer: &self.buffer,
                stop: &self.stop,
                producer,
                actuator: &mut teardown.actuator,
            };
            consumer(&mut ctx)
        };

        let acquisition = teardown.run();
        match &acquisition {
            Some(r) if r.exit.is_fatal() => warn!("acquisition ended: {}", r.exit),
            Some(r) => info!("acquisition ended: {}", r.exit),
            None => {}
        }
        match result {
            Ok(consumer) => Ok(SessionReport { consumer, acquisition }),
            Err(ControlError::SensorLost { exit: None }) => {
                let e = ControlError::SensorLost { exit: acquisition.map(|r| r.exit) };
                error!("session aborted: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("session aborted: {}", e);
                Err(e)
            }
        }
    }
}

struct Teardown<A: Actuator> {
    stop: StopSignal,
    task: Option<ScanAcquisitionTask>,
    actuator: ActuatorGuard<A>,
    join_timeout: Duration,
    done: bool,
}

impl<A: Actuator> Teardown<A> {
    fn run(&mut self) -> Option<AcquisitionReport> {
        if self.done {
            return None;
        }
        self.done = true;
        self.stop.raise();
        let joined = self.task.take().map(|t| t.wait(self.join_timeout));
        self.actuator.halt();
        let report = match joined {
            Some(Some(outcome)) => {
                match outcome.source {
                    Some(mut source) => source.release(),
                    None => warn!("sensor handle lost with the acquisition thread, not released"),
                }
                Some(outcome.report)
            }
            Some(None) => {
                warn!("acquisition still blocked in the driver, sensor handle not released");
                None
            }
            None => None,
        };
        self.actuator.shutdown();
        info!("session shut down");
        report
    }
}

impl<A: Actuator> Drop for Teardown<A> {
    fn drop(&mut self) {
        self.run();
    }
}

/// Foreground decide-and-drive loop.
pub struct ControlLoop<'r> {
    engine: DecisionEngine,
    gate: CooldownGate,
    opts: ControlOptions,
    recorder: Option<Box<dyn FrameRecorder + 'r>>,
}

impl<'r> ControlLoop<'r> {
    pub fn new(engine: DecisionEngine, gate: CooldownGate, opts: ControlOptions) -> Self {
        Self { engine, gate, opts, recorder: None }
    }

    /// Record admitted actions with their frames when `record_autonomous` is set.
    pub fn with_recorder(mut self, recorder: Box<dyn FrameRecorder + 'r>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn run<A: Actuator>(&mut self, ctx: &mut SessionContext<'_, A>) -> Result<LoopReport, ControlError> {
        let clock = Instant::now();
        let mut report = LoopReport::default();
        let mut last_seq = 0u64;
        let mut last_executed: Option<Action> = None;
        let mut holding_for_data = false;
        info!("control loop running with {} policy", self.engine.policy_name());

        while !ctx.stop.is_raised() {
            report.ticks += 1;
            let now_us = clock.elapsed().as_micros() as i64;

            let Some(stamped) = ctx.buffer.snapshot_stamped() else {
                if ctx.producer.has_exited() {
                    error!("acquisition exited before the first frame");
                    return Err(ControlError::SensorLost { exit: None });
                }
                report.idle_ticks += 1;
                thread::sleep(self.opts.idle_delay);
                continue;
            };

            if stamped.age(Instant::now()) > self.opts.staleness {
                if ctx.producer.has_exited() {
                    error!("last frame is {:?} old and acquisition has exited", stamped.age(Instant::now()));
                    return Err(ControlError::SensorLost { exit: None });
                }
                report.stale_ticks += 1;
                if !holding_for_data {
                    warn!("no fresh frame for {:?}, holding stop", self.opts.staleness);
                    ctx.actuator.execute(self.gate.force(Action::Stop, now_us));
                    last_executed = Some(Action::Stop);
                    holding_for_data = true;
                }
                thread::sleep(self.opts.idle_delay);
                continue;
            }

            if stamped.seq == last_seq {
                report.idle_ticks += 1;
                thread::sleep(self.opts.idle_delay);
                continue;
            }
            last_seq = stamped.seq;
            if holding_for_data {
                info!("fresh frames again, resuming");
                holding_for_data = false;
            }

            let proposed = self.engine.decide(&stamped.frame);
            report.decisions += 1;
            let admitted = self.gate.admit(proposed, now_us);
            if admitted != proposed {
                report.suppressed += 1;
            }
            if last_executed != Some(admitted) {
                report.action_changes += 1;
                debug!("frame {}: {} (proposed {})", stamped.seq, admitted, proposed);
            }
            ctx.actuator.execute(admitted);
            last_executed = Some(admitted);

            if self.opts.record_autonomous {
                if let Some(recorder) = self.recorder.as_mut() {
                    match recorder.record(&stamped.frame, admitted) {
                        Ok(RecordOutcome::Written) => report.records_written += 1,
                        Ok(RecordOutcome::SkippedEmpty) => {}
                        Err(e) => warn!("dropping training record: {}", e),
                    }
                }
            }
        }
        info!(
            "control loop stopped: {} decisions, {} suppressed, {} changes",
            report.decisions, report.suppressed, report.action_changes
        );
        Ok(report)
    }
}
