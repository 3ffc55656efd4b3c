use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One measurement reported by the range sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeSample {
    pub quality: u8,
    pub angle_deg: f32,
    pub distance_mm: f32,
}

impl RangeSample {
    pub fn new(quality: u8, angle_deg: f32, distance_mm: f32) -> Self {
        Self { quality, angle_deg, distance_mm }
    }

    /// A sample is usable when the sensor reported a non-zero quality and a
    /// positive range, and both angle and range are finite.
    pub fn is_valid(&self) -> bool {
        self.quality > 0
            && self.angle_deg.is_finite()
            && self.distance_mm.is_finite()
            && self.distance_mm > 0.0
    }
}

/// One batch of samples from roughly one sensor rotation.
///
/// Samples keep the order the driver delivered them in; they are neither
/// angle-sorted nor deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeFrame {
    pub samples: Vec<RangeSample>,
}

impl RangeFrame {
    pub fn new(samples: Vec<RangeSample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn valid_len(&self) -> usize {
        self.samples.iter().filter(|s| s.is_valid()).count()
    }

    /// Copy of this frame without low-quality or non-positive-range samples.
    pub fn retain_valid(&self) -> RangeFrame {
        RangeFrame {
            samples: self.samples.iter().copied().filter(RangeSample::is_valid).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangeSample> {
        self.samples.iter()
    }
}

impl FromIterator<RangeSample> for RangeFrame {
    fn from_iter<I: IntoIterator<Item = RangeSample>>(iter: I) -> Self {
        Self { samples: iter.into_iter().collect() }
    }
}

/// Fixed-width normalized distances, one slot per integer-degree bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn zeros(width: usize) -> Self {
        Self { values: vec![0.0; width] }
    }

    pub(crate) fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Discrete steering command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Forward,
    Left,
    Right,
    Stop,
    Reverse,
}

impl Action {
    pub const ALL: [Action; 5] =
        [Action::Forward, Action::Left, Action::Right, Action::Stop, Action::Reverse];

    pub fn name(&self) -> &'static str {
        match self {
            Action::Forward => "forward",
            Action::Left => "left",
            Action::Right => "right",
            Action::Stop => "stop",
            Action::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Ordered action vocabulary of a deployment.
///
/// The position of an action is its class index for learned models and
/// training labels, so it has to match whatever produced the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionSet(Vec<Action>);

impl Default for ActionSet {
    fn default() -> Self {
        Self(vec![Action::Forward, Action::Left, Action::Right, Action::Stop])
    }
}

impl ActionSet {
    pub fn new(actions: Vec<Action>) -> Self {
        Self(actions)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn action(&self, index: usize) -> Option<Action> {
        self.0.get(index).copied()
    }

    pub fn index_of(&self, action: Action) -> Option<usize> {
        self.0.iter().position(|a| *a == action)
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0.contains(&action)
    }

    pub fn actions(&self) -> &[Action] {
        &self.0
    }

    pub(crate) fn has_duplicates(&self) -> bool {
        self.0.iter().enumerate().any(|(i, a)| self.0[..i].contains(a))
    }
}
