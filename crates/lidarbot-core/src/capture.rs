//! Manual labelling consumer: an operator steers, each command is stored
//! with the frame that was current when the key was pressed.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use log::{debug, info, warn};

use crate::actuator::Actuator;
use crate::config::CaptureConfig;
use crate::control::{ControlError, SessionContext};
use crate::cooldown::CooldownGate;
use crate::domain::Action;
use crate::recorder::{FrameRecorder, RecordOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelEvent {
    Label(Action),
    Quit,
    /// Nothing to act on (unbound key or input timeout).
    Ignore,
}

/// Blocking source of operator labels. Implementations should return
/// `Ignore` periodically so the loop can notice a raised stop signal.
pub trait LabelSource {
    fn next_label(&mut self) -> std::io::Result<LabelEvent>;
}

#[derive(Debug, Clone)]
pub struct KeyBindings {
    keys: BTreeMap<char, Action>,
    quit: char,
}

impl KeyBindings {
    pub fn from_config(cfg: &CaptureConfig) -> Self {
        let keys = cfg
            .keys
            .iter()
            .filter_map(|(k, a)| k.chars().next().map(|c| (c.to_ascii_lowercase(), *a)))
            .collect();
        let quit = cfg.quit_key.chars().next().unwrap_or('q').to_ascii_lowercase();
        Self { keys, quit }
    }

    pub fn event_for(&self, key: char) -> LabelEvent {
        let key = key.to_ascii_lowercase();
        if key == self.quit {
            return LabelEvent::Quit;
        }
        self.keys.get(&key).map_or(LabelEvent::Ignore, |a| LabelEvent::Label(*a))
    }

    /// One-line help text, e.g. `w=forward a=left ... q=quit`.
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self.keys.iter().map(|(k, a)| format!("{k}={a}")).collect();
        parts.push(format!("{}=quit", self.quit));
        parts.join(" ")
    }
}

/// Labels from a fixed list; ends with `Quit` when exhausted.
#[derive(Debug, Default)]
pub struct ScriptedLabels(VecDeque<LabelEvent>);

impl ScriptedLabels {
    pub fn new(events: impl IntoIterator<Item = LabelEvent>) -> Self {
        Self(events.into_iter().collect())
    }
}

impl LabelSource for ScriptedLabels {
    fn next_label(&mut self) -> std::io::Result<LabelEvent> {
        Ok(self.0.pop_front().unwrap_or(LabelEvent::Quit))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub labels: u64,
    pub records_written: u64,
    pub skipped_empty: u64,
    pub record_errors: u64,
    /// Labels given before any frame was available.
    pub without_frame: u64,
    /// Labels whose command the cooldown gate replaced with the previous one.
    pub held_by_cooldown: u64,
}

pub struct CaptureLoop<L, R> {
    labels: L,
    recorder: R,
    gate: Option<CooldownGate>,
}

impl<L: LabelSource, R: FrameRecorder> CaptureLoop<L, R> {
    pub fn new(labels: L, recorder: R) -> Self {
        Self { labels, recorder, gate: None }
    }

    /// Pass executed commands through `gate`; `Stop` always goes through.
    /// The recorded label is always the operator's key, even when the gate
    /// holds the previous command.
    pub fn with_gate(mut self, gate: CooldownGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn into_parts(self) -> (L, R) {
        (self.labels, self.recorder)
    }

    pub fn run<A: Actuator>(&mut self, ctx: &mut SessionContext<'_, A>) -> Result<CaptureReport, ControlError> {
        let mut report = CaptureReport::default();
        let clock = Instant::now();
        while !ctx.stop.is_raised() {
            let event = self.labels.next_label().map_err(|e| ControlError::Input(e.to_string()))?;
            let action = match event {
                LabelEvent::Quit => {
                    info!("capture finished by operator");
                    break;
                }
                LabelEvent::Ignore => continue,
                LabelEvent::Label(action) => action,
            };
            report.labels += 1;

            match ctx.buffer.snapshot() {
                None => {
                    warn!("no scan available yet, {} not recorded", action);
                    report.without_frame += 1;
                }
                Some(frame) => match self.recorder.record(&frame, action) {
                    Ok(RecordOutcome::Written) => {
                        report.records_written += 1;
                        info!("saved scan ({} samples) + {}", frame.valid_len(), action);
                    }
                    Ok(RecordOutcome::SkippedEmpty) => report.skipped_empty += 1,
                    Err(e) => {
                        report.record_errors += 1;
                        warn!("could not save scan: {}", e);
                    }
                },
            }
            let now_us = clock.elapsed().as_micros() as i64;
            let executed = match self.gate.as_mut() {
                Some(gate) if action == Action::Stop => gate.force(action, now_us),
                Some(gate) => gate.admit(action, now_us),
                None => action,
            };
            if executed != action {
                report.held_by_cooldown += 1;
                debug!("{} held by cooldown, keeping {}", action, executed);
            }
            ctx.actuator.execute(executed);
        }
        Ok(report)
    }
}
