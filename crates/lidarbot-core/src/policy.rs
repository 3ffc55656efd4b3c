use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RoverConfig;
use crate::domain::{Action, ActionSet, FeatureVector, RangeFrame};
use crate::model::{argmax, softmax, InferenceModel, MlpModel, ModelLoadError};
use crate::normalize::normalize;
use crate::validation::filter_frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    RuleBased,
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectorKind {
    Ahead,
    Left,
    Right,
}

/// Angular range `[start_deg, end_deg)`, wrapping through 0 when `start > end`.
/// `0..360` covers the full circle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DangerSector {
    pub kind: SectorKind,
    pub start_deg: f32,
    pub end_deg: f32,
}

impl DangerSector {
    pub const fn new(kind: SectorKind, start_deg: f32, end_deg: f32) -> Self {
        Self { kind, start_deg, end_deg }
    }

    fn span(&self) -> f32 {
        if self.end_deg - self.start_deg >= 360.0 {
            return 360.0;
        }
        (self.end_deg - self.start_deg).rem_euclid(360.0)
    }

    fn offset(&self, angle_deg: f32) -> f32 {
        (angle_deg - self.start_deg).rem_euclid(360.0)
    }

    pub fn contains(&self, angle_deg: f32) -> bool {
        angle_deg.is_finite() && self.offset(angle_deg) < self.span()
    }

    pub fn midpoint(&self) -> f32 {
        (self.start_deg + self.span() / 2.0).rem_euclid(360.0)
    }

    /// True when the angle lies in the first half of the sector, before the midpoint.
    pub fn before_midpoint(&self, angle_deg: f32) -> bool {
        self.offset(angle_deg) < self.span() / 2.0
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let in_range = |v: f32| v.is_finite() && (0.0..=360.0).contains(&v);
        if !in_range(self.start_deg) || !in_range(self.end_deg) {
            return Err(format!(
                "sector {:?} bounds must lie in [0, 360], got {}..{}",
                self.kind, self.start_deg, self.end_deg
            ));
        }
        if self.span() == 0.0 {
            return Err(format!("sector {:?} is empty", self.kind));
        }
        Ok(())
    }
}

/// Built-in sector arrangements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectorLayout {
    /// One ahead sector, 60–120°.
    #[default]
    NarrowAhead,
    /// Ahead 45–135°, left 315–45°, right 135–225°, checked in that order.
    ThreeWay,
}

impl SectorLayout {
    pub fn sectors(&self) -> Vec<DangerSector> {
        match self {
            SectorLayout::NarrowAhead => vec![DangerSector::new(SectorKind::Ahead, 60.0, 120.0)],
            SectorLayout::ThreeWay => vec![
                DangerSector::new(SectorKind::Ahead, 45.0, 135.0),
                DangerSector::new(SectorKind::Left, 315.0, 45.0),
                DangerSector::new(SectorKind::Right, 135.0, 225.0),
            ],
        }
    }
}

/// What a policy gets to look at on one tick.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub frame: &'a RangeFrame,
    pub features: &'a FeatureVector,
}

pub trait Policy: Send {
    fn name(&self) -> &'static str;
    fn decide(&mut self, obs: &Observation<'_>) -> Action;
}

#[derive(Debug, Clone)]
pub struct RuleBasedAvoider {
    safe_distance_mm: f32,
    sectors: Vec<DangerSector>,
}

impl RuleBasedAvoider {
    /// `sectors` are evaluated in the given order; the first one with an obstacle decides.
    pub fn new(safe_distance_mm: f32, sectors: Vec<DangerSector>) -> Self {
        Self { safe_distance_mm, sectors }
    }

    pub fn sectors(&self) -> &[DangerSector] {
        &self.sectors
    }

    fn reaction(&self, sector: &DangerSector, frame: &RangeFrame) -> Option<Action> {
        let nearest = frame
            .iter()
            .filter(|s| s.is_valid() && s.distance_mm < self.safe_distance_mm)
            .filter(|s| sector.contains(s.angle_deg))
            .min_by(|a, b| a.distance_mm.total_cmp(&b.distance_mm))?;
        let action = match sector.kind {
            SectorKind::Left => Action::Right,
            SectorKind::Right => Action::Left,
            SectorKind::Ahead if sector.before_midpoint(nearest.angle_deg) => Action::Right,
            SectorKind::Ahead => Action::Left,
        };
        debug!(
            "obstacle {:?} at {:.1} deg, {:.0} mm -> {}",
            sector.kind, nearest.angle_deg, nearest.distance_mm, action
        );
        Some(action)
    }
}

impl Policy for RuleBasedAvoider {
    fn name(&self) -> &'static str {
        "rule-based"
    }

    fn decide(&mut self, obs: &Observation<'_>) -> Action {
        self.sectors
            .iter()
            .find_map(|sector| self.reaction(sector, obs.frame))
            .unwrap_or(Action::Forward)
    }
}

/// Steering by an external model: argmax of its scores mapped through the action set.
pub struct LearnedPolicy {
    model: Box<dyn InferenceModel>,
    actions: ActionSet,
}

impl std::fmt::Debug for LearnedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedPolicy")
            .field("input_width", &self.model.input_width())
            .field("actions", &self.actions)
            .finish()
    }
}

impl LearnedPolicy {
    /// Fails when the model's shape disagrees with the deployment.
    pub fn new(
        model: Box<dyn InferenceModel>,
        actions: ActionSet,
        feature_width: usize,
    ) -> Result<Self, ModelLoadError> {
        if model.input_width() != feature_width {
            return Err(ModelLoadError::WidthMismatch {
                model: model.input_width(),
                configured: feature_width,
            });
        }
        if model.output_len() != actions.len() {
            return Err(ModelLoadError::OutputMismatch {
                model: model.output_len(),
                configured: actions.len(),
            });
        }
        Ok(Self { model, actions })
    }
}

impl Policy for LearnedPolicy {
    fn name(&self) -> &'static str {
        "learned"
    }

    fn decide(&mut self, obs: &Observation<'_>) -> Action {
        let scores = self.model.infer(obs.features.as_slice());
        let Some(index) = argmax(&scores) else {
            warn!("model returned no finite scores, stopping");
            return Action::Stop;
        };
        match self.actions.action(index) {
            Some(action) => {
                debug!("probabilities {:?} -> {}", softmax(&scores), action);
                action
            }
            None => {
                warn!("model chose index {} outside the action set, stopping", index);
                Action::Stop
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelLoadError),
    #[error("invalid policy configuration: {0}")]
    Config(String),
}

/// Normalizes frames and hands them to the configured policy.
pub struct DecisionEngine {
    policy: Box<dyn Policy>,
    width: usize,
    filter_snapshots: bool,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("policy", &self.policy.name())
            .field("width", &self.width)
            .finish()
    }
}

impl DecisionEngine {
    pub fn new(policy: Box<dyn Policy>, width: usize) -> Self {
        Self { policy, width, filter_snapshots: false }
    }

    /// Build the engine a config asks for. A learned policy whose model cannot
    /// be loaded is an error, never a silent fallback.
    pub fn from_config(cfg: &RoverConfig) -> Result<Self, EngineError> {
        let width = cfg.features.width;
        if width == 0 {
            return Err(EngineError::Config("feature width must be at least 1".into()));
        }
        let policy: Box<dyn Policy> = match cfg.policy.kind {
            PolicyKind::RuleBased => {
                let rb = &cfg.policy.rule_based;
                Box::new(RuleBasedAvoider::new(rb.safe_distance_mm, rb.effective_sectors()))
            }
            PolicyKind::Learned => {
                let model = MlpModel::load(&cfg.policy.learned.model_path)?;
                Box::new(LearnedPolicy::new(Box::new(model), cfg.policy.actions.clone(), width)?)
            }
        };
        let filter_snapshots = cfg.sensor.filter_stage == crate::validation::FilterStage::Consumer;
        Ok(Self { policy, width, filter_snapshots })
    }

    /// Filter raw snapshots here instead of in acquisition.
    pub fn with_snapshot_filter(mut self, enabled: bool) -> Self {
        self.filter_snapshots = enabled;
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn decide(&mut self, frame: &RangeFrame) -> Action {
        if self.filter_snapshots {
            let filtered = filter_frame(frame.clone());
            return self.decide_filtered(&filtered);
        }
        self.decide_filtered(frame)
    }

    fn decide_filtered(&mut self, frame: &RangeFrame) -> Action {
        let features = normalize(frame, self.width);
        self.policy.decide(&Observation { frame, features: &features })
    }
}
