//! Learned steering model boundary.
//!
//! The control loop only needs `features -> logits`. [`MlpModel`] is the
//! inference side of the dense network the offline trainer produces,
//! exported as JSON weights.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("cannot read model file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("inconsistent layer shapes: {0}")]
    Shape(String),
    #[error("model contains non-finite weights in layer {0}")]
    NonFinite(usize),
    #[error("model expects {model} input features but the feature width is {configured}")]
    WidthMismatch { model: usize, configured: usize },
    #[error("model has {model} outputs but {configured} actions are configured")]
    OutputMismatch { model: usize, configured: usize },
}

/// Opaque inference collaborator.
pub trait InferenceModel: Send {
    fn input_width(&self) -> usize;
    fn output_len(&self) -> usize;
    /// Raw scores, one per action index.
    fn infer(&self, features: &[f32]) -> Vec<f32>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `weights[out][in]`
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl DenseLayer {
    fn inputs(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn outputs(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, input: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }
}

/// Feed-forward network with ReLU between layers and raw logits out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpModel {
    pub input_width: usize,
    pub layers: Vec<DenseLayer>,
}

impl MlpModel {
    pub fn from_layers(input_width: usize, layers: Vec<DenseLayer>) -> Result<Self, ModelLoadError> {
        let model = Self { input_width, layers };
        model.check()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelLoadError> {
        let model: MlpModel = serde_json::from_str(raw)?;
        model.check()?;
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn check(&self) -> Result<(), ModelLoadError> {
        if self.layers.is_empty() {
            return Err(ModelLoadError::Shape("model has no layers".into()));
        }
        let mut width = self.input_width;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.outputs() == 0 {
                return Err(ModelLoadError::Shape(format!("layer {i} has no outputs")));
            }
            if layer.bias.len() != layer.outputs() {
                return Err(ModelLoadError::Shape(format!(
                    "layer {i} has {} rows but {} biases",
                    layer.outputs(),
                    layer.bias.len()
                )));
            }
            if layer.weights.iter().any(|row| row.len() != width) || layer.inputs() != width {
                return Err(ModelLoadError::Shape(format!("layer {i} does not take {width} inputs")));
            }
            let finite = layer.weights.iter().flatten().chain(&layer.bias).all(|v| v.is_finite());
            if !finite {
                return Err(ModelLoadError::NonFinite(i));
            }
            width = layer.outputs();
        }
        Ok(())
    }
}

impl InferenceModel for MlpModel {
    fn input_width(&self) -> usize {
        self.input_width
    }

    fn output_len(&self) -> usize {
        self.layers.last().map_or(0, DenseLayer::outputs)
    }

    fn infer(&self, features: &[f32]) -> Vec<f32> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = features.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x);
            if i < last {
                x.iter_mut().for_each(|v| *v = v.max(0.0));
            }
        }
        x
    }
}

/// Index of the largest finite score.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
            Some((_, b)) if b >= *v => best,
            _ => Some((i, *v)),
        })
        .map(|(i, _)| i)
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
