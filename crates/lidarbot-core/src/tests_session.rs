use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::{
    AcquisitionExit, AcquisitionOptions, Action, Actuator, CaptureLoop, ControlError, ControlLoop,
    ControlOptions, CooldownGate, DecisionEngine, FrameRecorder, LabelEvent, LabelSource, RangeFrame,
    RangeSample, RecordOutcome, RecordingError, RuleBasedAvoider, ScriptedLabels, ScriptedSource, SectorLayout, Session,
    StopSignal,
};

#[derive(Clone, Default)]
struct MotorLog {
    calls: Arc<Mutex<Vec<Action>>>,
    released: Arc<AtomicBool>,
}

impl MotorLog {
    fn calls(&self) -> Vec<Action> {
        self.calls.lock().unwrap().clone()
    }
}

struct LoggedActuator {
    motor: MotorLog,
    stop: StopSignal,
    stop_after: usize,
    stop_on: Option<Action>,
    delay: Duration,
}

impl LoggedActuator {
    fn new(motor: &MotorLog, stop: &StopSignal) -> Self {
        Self { motor: motor.clone(), stop: stop.clone(), stop_after: usize::MAX, stop_on: None, delay: Duration::ZERO }
    }
}

impl Actuator for LoggedActuator {
    fn execute(&mut self, action: Action) {
        let n = {
            let mut calls = self.motor.calls.lock().unwrap();
            calls.push(action);
            calls.len()
        };
        if self.stop_on == Some(action) || n >= self.stop_after {
            self.stop.raise();
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }

    fn release(&mut self) {
        self.motor.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MemoryRecorder(Vec<(RangeFrame, Action)>);

impl FrameRecorder for MemoryRecorder {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        if frame.valid_len() == 0 {
            return Ok(RecordOutcome::SkippedEmpty);
        }
        self.0.push((frame.clone(), action));
        Ok(RecordOutcome::Written)
    }
}

fn clear_frame() -> RangeFrame {
    (0..360).map(|a| RangeSample::new(12, a as f32, 1000.0)).collect()
}

fn blocked_ahead() -> RangeFrame {
    let mut frame = clear_frame();
    frame.samples[100] = RangeSample::new(12, 100.0, 50.0);
    frame
}

fn rule_engine() -> DecisionEngine {
    DecisionEngine::new(Box::new(RuleBasedAvoider::new(200.0, SectorLayout::NarrowAhead.sectors())), 360)
}

fn session(stop: &StopSignal) -> Session {
    Session::new(stop.clone(), AcquisitionOptions::default(), Duration::from_secs(2))
}

fn opts() -> ControlOptions {
    ControlOptions {
        idle_delay: Duration::from_millis(1),
        staleness: Duration::from_millis(500),
        producer_join_timeout: Duration::from_secs(2),
        record_autonomous: false,
    }
}

#[test]
fn clear_path_drives_forward_without_recording() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let mut actuator = LoggedActuator::new(&motor, &stop);
    actuator.stop_after = 5;
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(2));
    let released = source.released_flag();

    let mut recorder = MemoryRecorder::default();
    let report = {
        let mut control = ControlLoop::new(rule_engine(), CooldownGate::new(100_000), opts())
            .with_recorder(Box::new(&mut recorder));
        session(&stop).run(source, actuator, |ctx| control.run(ctx)).unwrap()
    };

    let calls = motor.calls();
    assert!(calls[..5].iter().all(|a| *a == Action::Forward));
    assert_eq!(calls.last(), Some(&Action::Stop));
    assert!(motor.released.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(report.consumer.decisions, 5);
    assert_eq!(report.consumer.action_changes, 1);
    assert_eq!(report.acquisition.unwrap().exit, AcquisitionExit::Cancelled);
    assert!(recorder.0.is_empty());
}

#[test]
fn cancellation_mid_turn_ends_with_stop() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let mut actuator = LoggedActuator::new(&motor, &stop);
    actuator.stop_on = Some(Action::Left);
    actuator.delay = Duration::from_millis(20);
    let source = ScriptedSource::from_frames(vec![blocked_ahead()]).repeating().with_delay(Duration::from_millis(1));

    let s = session(&stop);
    let buffer = Arc::clone(s.buffer());
    let mut control = ControlLoop::new(rule_engine(), CooldownGate::new(100_000), opts());
    s.run(source, actuator, |ctx| control.run(ctx)).unwrap();

    assert_eq!(motor.calls(), vec![Action::Left, Action::Stop]);
    assert!(motor.released.load(Ordering::SeqCst));
    let published = buffer.published_count();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(buffer.published_count(), published);
}

#[test]
fn lost_sensor_aborts_with_full_cleanup() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let actuator = LoggedActuator::new(&motor, &stop);
    let source = ScriptedSource::from_frames(vec![clear_frame(), clear_frame()]);
    let released = source.released_flag();
    let mut control = ControlLoop::new(
        rule_engine(),
        CooldownGate::new(100_000),
        ControlOptions { staleness: Duration::from_millis(30), ..opts() },
    );

    let err = session(&stop).run(source, actuator, |ctx| control.run(ctx)).unwrap_err();
    match err {
        ControlError::SensorLost { exit: Some(AcquisitionExit::Disconnected(msg)) } => {
            assert_eq!(msg, "frame stream ended")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(motor.calls().last(), Some(&Action::Stop));
    assert!(motor.released.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn producer_that_never_delivers_is_sensor_lost() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let source = ScriptedSource::new(vec![]);
    let mut control = ControlLoop::new(rule_engine(), CooldownGate::new(100_000), opts());
    let err = session(&stop)
        .run(source, LoggedActuator::new(&motor, &stop), |ctx| control.run(ctx))
        .unwrap_err();
    assert!(matches!(err, ControlError::SensorLost { exit: Some(AcquisitionExit::Disconnected(_)) }));
    assert!(err.to_string().contains("frame stream ended"));
    assert_eq!(motor.calls(), vec![Action::Stop]);
}

#[test]
fn stale_frames_hold_stop() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let mut actuator = LoggedActuator::new(&motor, &stop);
    actuator.stop_after = 2;
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(200));
    let mut control = ControlLoop::new(
        rule_engine(),
        CooldownGate::new(100_000),
        ControlOptions { staleness: Duration::from_millis(40), ..opts() },
    );

    let report = session(&stop).run(source, actuator, |ctx| control.run(ctx)).unwrap();
    assert_eq!(motor.calls(), vec![Action::Forward, Action::Stop]);
    assert!(report.consumer.stale_ticks >= 1);
}

#[test]
fn producer_stuck_past_join_timeout_leaves_sensor_unreleased() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(500));
    let released = source.released_flag();
    let s = Session::new(stop.clone(), AcquisitionOptions::default(), Duration::from_millis(20));

    let report = s
        .run(source, LoggedActuator::new(&motor, &stop), |ctx| -> Result<(), ControlError> {
            ctx.actuator.execute(Action::Forward);
            Ok(())
        })
        .unwrap();

    assert!(report.acquisition.is_none());
    assert!(!released.load(Ordering::SeqCst));
    assert_eq!(motor.calls(), vec![Action::Forward, Action::Stop]);
    assert!(motor.released.load(Ordering::SeqCst));
}

#[test]
fn autonomous_recording_stores_admitted_actions() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let mut actuator = LoggedActuator::new(&motor, &stop);
    actuator.stop_after = 3;
    let source = ScriptedSource::from_frames(vec![blocked_ahead()]).repeating().with_delay(Duration::from_millis(2));

    let mut recorder = MemoryRecorder::default();
    {
        let mut control = ControlLoop::new(
            rule_engine(),
            CooldownGate::new(1_000_000),
            ControlOptions { record_autonomous: true, ..opts() },
        )
        .with_recorder(Box::new(&mut recorder));
        session(&stop).run(source, actuator, |ctx| control.run(ctx)).unwrap();
    }
    assert_eq!(recorder.0.len(), 3);
    assert!(recorder.0.iter().all(|(f, a)| *a == Action::Left && f.len() == 360));
}

#[test]
fn panicking_consumer_still_stops_the_robot() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(1));
    let released = source.released_flag();
    let s = session(&stop);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = s.run(source, LoggedActuator::new(&motor, &stop), |ctx| -> Result<(), ControlError> {
            ctx.actuator.execute(Action::Right);
            panic!("policy bug");
        });
    }));
    assert!(result.is_err());
    assert_eq!(motor.calls(), vec![Action::Right, Action::Stop]);
    assert!(motor.released.load(Ordering::SeqCst));
    assert!(released.load(Ordering::SeqCst));
    assert!(stop.is_raised());
}

struct DelayedLabels {
    events: Vec<LabelEvent>,
    delay: Duration,
}

impl LabelSource for DelayedLabels {
    fn next_label(&mut self) -> std::io::Result<LabelEvent> {
        thread::sleep(self.delay);
        if self.events.is_empty() {
            return Ok(LabelEvent::Quit);
        }
        Ok(self.events.remove(0))
    }
}

#[test]
fn capture_records_labelled_frames() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let s = session(&stop);
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(1));
    let labels = DelayedLabels {
        events: vec![
            LabelEvent::Label(Action::Forward),
            LabelEvent::Ignore,
            LabelEvent::Label(Action::Left),
        ],
        delay: Duration::from_millis(30),
    };
    let mut capture = CaptureLoop::new(labels, MemoryRecorder::default());
    let report = s.run(source, LoggedActuator::new(&motor, &stop), |ctx| capture.run(ctx)).unwrap();

    assert_eq!(report.consumer.labels, 2);
    assert_eq!(report.consumer.records_written, 2);
    let (_, recorder) = capture.into_parts();
    let actions: Vec<Action> = recorder.0.iter().map(|(_, a)| *a).collect();
    assert_eq!(actions, vec![Action::Forward, Action::Left]);
    assert_eq!(motor.calls(), vec![Action::Forward, Action::Left, Action::Stop]);
}

#[test]
fn capture_without_frames_records_nothing() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let source = ScriptedSource::from_frames(vec![clear_frame()]).with_delay(Duration::from_millis(300));
    let labels = ScriptedLabels::new(vec![LabelEvent::Label(Action::Right)]);
    let mut capture = CaptureLoop::new(labels, MemoryRecorder::default());
    let report = session(&stop).run(source, LoggedActuator::new(&motor, &stop), |ctx| capture.run(ctx)).unwrap();
    assert_eq!(report.consumer.without_frame, 1);
    assert_eq!(report.consumer.records_written, 0);
    assert_eq!(motor.calls(), vec![Action::Right, Action::Stop]);
}

#[test]
fn capture_gate_holds_commands_but_records_raw_labels() {
    let stop = StopSignal::new();
    let motor = MotorLog::default();
    let s = session(&stop);
    let source = ScriptedSource::from_frames(vec![clear_frame()]).repeating().with_delay(Duration::from_millis(1));
    let labels = DelayedLabels {
        events: vec![
            LabelEvent::Label(Action::Left),
            LabelEvent::Label(Action::Right),
            LabelEvent::Label(Action::Stop),
        ],
        delay: Duration::from_millis(30),
    };
    let mut capture = CaptureLoop::new(labels, MemoryRecorder::default()).with_gate(CooldownGate::new(10_000_000));
    let report = s.run(source, LoggedActuator::new(&motor, &stop), |ctx| capture.run(ctx)).unwrap();

    assert_eq!(report.consumer.labels, 3);
    assert_eq!(report.consumer.held_by_cooldown, 1);
    let (_, recorder) = capture.into_parts();
    let recorded: Vec<Action> = recorder.0.iter().map(|(_, a)| *a).collect();
    assert_eq!(recorded, vec![Action::Left, Action::Right, Action::Stop]);
    // Right is held as Left; Stop is never held
    assert_eq!(motor.calls(), vec![Action::Left, Action::Left, Action::Stop]);
}
