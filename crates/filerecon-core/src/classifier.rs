use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::compare::{FeatureVector, FEATURE_COUNT};
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Same,
    Different,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Label,
    /// Confidence in `label`, in `[0, 1]`.
    pub confidence: f64,
}

/// Trained predictor deciding whether two descriptors are the same file.
///
/// The engine depends on this contract only; which model sits behind it is a
/// configuration choice.
pub trait IdentityClassifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifierError>;
}

/// Logistic regression over the comparator's feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.5
}

impl LogisticModel {
    /// Model shipped with the crate, used when no artifact is configured.
    pub fn builtin() -> Self {
        Self {
            // name_similarity, size_delta, fingerprint_equal, mtime_delta
            weights: vec![8.0, -4.0, 10.0, -0.25],
            bias: -6.0,
            threshold: 0.5,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ClassifierError> {
        let model: LogisticModel =
            serde_json::from_str(raw).map_err(|e| ClassifierError::Artifact(e.to_string()))?;
        model.check()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ClassifierError::Artifact(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn with_threshold(mut self, threshold: f64) -> Result<Self, ClassifierError> {
        self.threshold = threshold;
        self.check()?;
        Ok(self)
    }

    /// Probability that the pair is the same file.
    pub fn probability(&self, features: &FeatureVector) -> Result<f64, ClassifierError> {
        features.validate()?;
        let values = features.as_array();
        if self.weights.len() != values.len() {
            return Err(ClassifierError::InvalidInput(format!(
                "model expects {} features, got {}",
                self.weights.len(),
                values.len()
            )));
        }
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(values.iter())
                .map(|(w, x)| w * x)
                .sum::<f64>();
        Ok(1.0 / (1.0 + (-z).exp()))
    }

    fn check(&self) -> Result<(), ClassifierError> {
        if self.weights.is_empty() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(ClassifierError::Artifact(
                "weights must be a non-empty list of finite numbers".to_string(),
            ));
        }
        if !self.bias.is_finite() {
            return Err(ClassifierError::Artifact("bias must be finite".to_string()));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ClassifierError::Artifact(format!(
                "threshold {} not in (0, 1)",
                self.threshold
            )));
        }
        Ok(())
    }
}

impl IdentityClassifier for LogisticModel {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        let p = self.probability(features)?;
        Ok(if p >= self.threshold {
            Prediction {
                label: Label::Same,
                confidence: p,
            }
        } else {
            Prediction {
                label: Label::Different,
                confidence: 1.0 - p,
            }
        })
    }
}

/// Resolve the configured classifier artifact.
pub fn load_classifier(
    config: &ClassifierConfig,
) -> Result<Arc<dyn IdentityClassifier>, ClassifierError> {
    let model = match &config.model_path {
        Some(path) => {
            info!("Loading identity classifier from {}", path);
            LogisticModel::load(Path::new(path))?
        }
        None => LogisticModel::builtin(),
    };
    let model = match config.threshold {
        Some(threshold) => model.with_threshold(threshold)?,
        None => model,
    };
    if model.weights.len() != FEATURE_COUNT {
        return Err(ClassifierError::Artifact(format!(
            "model has {} weights, the comparator produces {} features",
            model.weights.len(),
            FEATURE_COUNT
        )));
    }
    Ok(Arc::new(model))
}
