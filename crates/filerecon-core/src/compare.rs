use ahash::AHashSet;
use serde::Serialize;
use tracing::warn;

use crate::classifier::{IdentityClassifier, Label};
use crate::descriptor::FileDescriptor;
use crate::error::ClassifierError;

pub const FEATURE_COUNT: usize = 4;

/// `log10(1 + one year in seconds)`, used when a modification time is unknown.
pub const UNKNOWN_MTIME_PENALTY: f64 = 7.498_806_620_706_755;

/// Similarity signals between two descriptors, in the order the model expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    pub name_similarity: f64,
    pub size_delta: f64,
    pub fingerprint_equal: f64,
    pub mtime_delta: f64,
}

impl FeatureVector {
    pub fn between(a: &FileDescriptor, b: &FileDescriptor) -> Self {
        let fingerprint_equal = if a.fingerprint == b.fingerprint { 1.0 } else { 0.0 };
        let mtime_delta = match (a.last_modified, b.last_modified) {
            (Some(x), Some(y)) => {
                let secs = (x - y).num_milliseconds().unsigned_abs() as f64 / 1000.0;
                (1.0 + secs).log10()
            }
            _ => UNKNOWN_MTIME_PENALTY,
        };
        Self {
            name_similarity: name_similarity(&a.name, &b.name),
            size_delta: size_delta(a.size, b.size),
            fingerprint_equal,
            mtime_delta,
        }
    }

    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.name_similarity,
            self.size_delta,
            self.fingerprint_equal,
            self.mtime_delta,
        ]
    }

    /// Reject values outside each feature's domain.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let unit = |name: &str, v: f64| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ClassifierError::InvalidInput(format!("{} = {} not in [0, 1]", name, v)))
            }
        };
        unit("name_similarity", self.name_similarity)?;
        unit("size_delta", self.size_delta)?;
        if self.fingerprint_equal != 0.0 && self.fingerprint_equal != 1.0 {
            return Err(ClassifierError::InvalidInput(format!(
                "fingerprint_equal = {} is not a flag",
                self.fingerprint_equal
            )));
        }
        if !self.mtime_delta.is_finite() || self.mtime_delta < 0.0 {
            return Err(ClassifierError::InvalidInput(format!(
                "mtime_delta = {} is not a non-negative number",
                self.mtime_delta
            )));
        }
        Ok(())
    }
}

/// How a pair's label was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Equal fingerprints; the classifier was not consulted.
    Fingerprint,
    Classifier,
    /// The classifier rejected the input; the pair counts as different.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IdentityDecision {
    pub left: usize,
    pub right: usize,
    pub label: Label,
    pub confidence: f64,
    pub source: DecisionSource,
}

/// Decide whether `descriptors[left]` and `descriptors[right]` are the same
/// logical file.
pub fn decide(
    descriptors: &[FileDescriptor],
    left: usize,
    right: usize,
    classifier: &dyn IdentityClassifier,
) -> IdentityDecision {
    let a = &descriptors[left];
    let b = &descriptors[right];

    if a.fingerprint == b.fingerprint {
        return IdentityDecision {
            left,
            right,
            label: Label::Same,
            confidence: 1.0,
            source: DecisionSource::Fingerprint,
        };
    }

    let features = FeatureVector::between(a, b);
    match classifier.predict(&features) {
        Ok(prediction) => IdentityDecision {
            left,
            right,
            label: prediction.label,
            confidence: prediction.confidence,
            source: DecisionSource::Classifier,
        },
        Err(e) => {
            warn!(
                "Classifier failed on {}:{} vs {}:{}: {}",
                a.backend_id, a.path, b.backend_id, b.path, e
            );
            IdentityDecision {
                left,
                right,
                label: Label::Different,
                confidence: 0.0,
                source: DecisionSource::Fallback,
            }
        }
    }
}

/// Jaccard index of the lowercase character-bigram sets of two names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }

    let a_set = bigrams(&a);
    let b_set = bigrams(&b);
    let union = a_set.union(&b_set).count();
    if union == 0 {
        return 0.0;
    }
    a_set.intersection(&b_set).count() as f64 / union as f64
}

/// `|a - b| / max(a, b, 1)`
pub fn size_delta(a: u64, b: u64) -> f64 {
    a.abs_diff(b) as f64 / a.max(b).max(1) as f64
}

fn bigrams(s: &str) -> AHashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}
