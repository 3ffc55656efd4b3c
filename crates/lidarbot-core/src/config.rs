use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::ActuationStyle;
use crate::domain::{Action, ActionSet};
use crate::policy::{DangerSector, PolicyKind, SectorLayout};
use crate::sensor::SimulatedLidarConfig;
use crate::validation::FilterStage;

/// Environment variables with this prefix override file settings,
/// e.g. `LIDARBOT_POLICY__RULE_BASED__SAFE_DISTANCE_MM=250`.
pub const ENV_PREFIX: &str = "LIDARBOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    pub sensor: SensorConfig,
    pub features: FeatureConfig,
    pub policy: PolicyConfig,
    pub cooldown: CooldownConfig,
    pub actuator: ActuatorConfig,
    pub control: ControlConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial device of the range sensor, handed to the hardware driver.
    pub port: String,
    pub filter_stage: FilterStage,
    /// Frames with fewer valid samples are not published.
    pub min_frame_samples: usize,
    /// Leading frames dropped while the sensor spins up.
    pub discard_initial_frames: usize,
    pub max_consecutive_errors: u32,
    /// Settings for the simulated sensor used without hardware.
    pub sim: SimulatedLidarConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            filter_stage: FilterStage::Producer,
            min_frame_samples: 0,
            discard_initial_frames: 0,
            max_consecutive_errors: 5,
            sim: SimulatedLidarConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Number of integer-degree buckets; must match the width a model was trained with.
    pub width: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self { width: 360 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    /// Index-to-action mapping for model outputs and training labels.
    pub actions: ActionSet,
    pub rule_based: RuleBasedConfig,
    pub learned: LearnedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleBasedConfig {
    pub safe_distance_mm: f32,
    pub layout: SectorLayout,
    /// Explicit sectors in priority order; overrides `layout` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sectors: Option<Vec<DangerSector>>,
}

impl Default for RuleBasedConfig {
    fn default() -> Self {
        Self { safe_distance_mm: 200.0, layout: SectorLayout::NarrowAhead, sectors: None }
    }
}

impl RuleBasedConfig {
    pub fn effective_sectors(&self) -> Vec<DangerSector> {
        match &self.sectors {
            Some(sectors) => sectors.clone(),
            None => self.layout.sectors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnedConfig {
    pub model_path: PathBuf,
}

impl Default for LearnedConfig {
    fn default() -> Self {
        Self { model_path: PathBuf::from("model.json") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    /// Minimum seconds between admitted actions.
    pub obstacle_cooldown_s: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { obstacle_cooldown_s: 0.1 }
    }
}

impl CooldownConfig {
    pub fn min_interval_us(&self) -> i64 {
        (self.obstacle_cooldown_s * 1_000_000.0).round() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub style: ActuationStyle,
    pub forward_pulse_ms: u64,
    pub turn_pulse_ms: u64,
    /// Continuous style: motors stop when no command arrives for this long.
    pub watchdog_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            style: ActuationStyle::Pulse,
            forward_pulse_ms: 200,
            turn_pulse_ms: 100,
            watchdog_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub idle_delay_ms: u64,
    /// A frame older than this is not acted on.
    pub staleness_ms: u64,
    pub producer_join_timeout_ms: u64,
    /// Store every autonomously admitted action with its frame.
    pub record_autonomous: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            idle_delay_ms: 5,
            staleness_ms: 1000,
            producer_join_timeout_ms: 2000,
            record_autonomous: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub keys: BTreeMap<String, Action>,
    pub quit_key: String,
    pub db_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let keys = [("w", Action::Forward), ("a", Action::Left), ("d", Action::Right), ("s", Action::Stop)]
            .into_iter()
            .map(|(k, a)| (k.to_string(), a))
            .collect();
        Self { keys, quit_key: "q".into(), db_path: PathBuf::from("lidar_training_data.db") }
    }
}

impl RoverConfig {
    /// Defaults, then the optional TOML file, then `LIDARBOT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: RoverConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: RoverConfig = config::Config::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.features.width == 0 {
            return invalid("features.width must be at least 1".into());
        }
        let cd = self.cooldown.obstacle_cooldown_s;
        if !cd.is_finite() || cd < 0.0 {
            return invalid(format!("cooldown.obstacle_cooldown_s must be >= 0, got {cd}"));
        }
        if self.policy.actions.is_empty() {
            return invalid("policy.actions must not be empty".into());
        }
        if self.policy.actions.has_duplicates() {
            return invalid("policy.actions lists an action twice".into());
        }

        let rb = &self.policy.rule_based;
        if !rb.safe_distance_mm.is_finite() || rb.safe_distance_mm <= 0.0 {
            return invalid(format!("safe_distance_mm must be > 0, got {}", rb.safe_distance_mm));
        }
        let sectors = rb.effective_sectors();
        if sectors.is_empty() {
            return invalid("at least one danger sector is required".into());
        }
        for s in &sectors {
            s.validate().map_err(ConfigError::Invalid)?;
        }

        if self.actuator.forward_pulse_ms == 0 || self.actuator.turn_pulse_ms == 0 {
            return invalid("actuator pulse durations must be > 0".into());
        }
        if self.actuator.watchdog_ms == 0 {
            return invalid("actuator.watchdog_ms must be > 0".into());
        }
        if self.control.staleness_ms == 0 {
            return invalid("control.staleness_ms must be > 0".into());
        }

        let cap = &self.capture;
        if cap.quit_key.chars().count() != 1 {
            return invalid(format!("capture.quit_key must be one character, got {:?}", cap.quit_key));
        }
        for (key, action) in &cap.keys {
            if key.chars().count() != 1 {
                return invalid(format!("capture key {key:?} must be one character"));
            }
            if key.eq_ignore_ascii_case(&cap.quit_key) {
                return invalid(format!("capture key {key:?} is also the quit key"));
            }
            if !self.policy.actions.contains(*action) {
                return invalid(format!("capture key {key:?} maps to {action}, which is not in policy.actions"));
            }
        }
        Ok(())
    }
}
