//! The classifier under attack.

use crate::resources::{GradientSignal, ResourceError, normalize_word};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use thiserror::Error;

/// Errors raised by a classifier. During an attack any of these aborts the
/// invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Classifier panicked on batch item {index}: {message}")]
    Panicked { index: usize, message: String },

    #[error("Classifier returned {actual} outputs for a batch of {expected}")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("Classifier returned an empty score vector for batch item {index}")]
    EmptyOutput { index: usize },

    #[error("Batch item {index} has {actual} scores, expected {expected}")]
    RaggedOutput {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Batch item {index} has invalid score {value}")]
    InvalidScore { index: usize, value: f64 },

    #[error("Classifier backend failed: {0}")]
    Backend(String),

    #[error("Invalid model weights: {message}")]
    InvalidWeights { message: String },
}

impl ModelError {
    /// Batch position the error refers to, when it refers to a single item.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            ModelError::Panicked { index, .. }
            | ModelError::EmptyOutput { index }
            | ModelError::RaggedOutput { index, .. }
            | ModelError::InvalidScore { index, .. } => Some(*index),
            ModelError::BatchSizeMismatch { .. }
            | ModelError::Backend(_)
            | ModelError::InvalidWeights { .. } => None,
        }
    }
}

/// The oracle: one probability-like score vector per token sequence.
///
/// Implementations must be deterministic for identical input. Outputs are
/// checked with [`validate_outputs`] before the goal function reads them.
pub trait Classifier: Send + Sync {
    fn predict(&self, batch: &[Vec<String>]) -> Result<Vec<Vec<f64>>, ModelError>;

    /// Number of classes, when known up front. Lets targeted goals fail fast.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// Checks batch length, emptiness, uniform width, and that every score is
/// finite and non-negative.
pub fn validate_outputs(batch_len: usize, outputs: &[Vec<f64>]) -> Result<(), ModelError> {
    if outputs.len() != batch_len {
        return Err(ModelError::BatchSizeMismatch {
            expected: batch_len,
            actual: outputs.len(),
        });
    }
    let Some(width) = outputs.first().map(Vec::len) else {
        return Ok(());
    };
    for (index, output) in outputs.iter().enumerate() {
        if output.is_empty() {
            return Err(ModelError::EmptyOutput { index });
        }
        if output.len() != width {
            return Err(ModelError::RaggedOutput {
                index,
                expected: width,
                actual: output.len(),
            });
        }
        if let Some(&value) = output.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(ModelError::InvalidScore { index, value });
        }
    }
    Ok(())
}

/// Index of the largest score; the first one wins ties.
pub fn argmax(scores: &[f64]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// Wraps a plain function as a classifier, converting panics into
/// [`ModelError::Panicked`] so a faulty model cannot take down the process.
pub struct FnClassifier<F>
where
    F: Fn(&[String]) -> Vec<f64>,
{
    predict_fn: F,
    num_classes: Option<usize>,
}

impl<F> FnClassifier<F>
where
    F: Fn(&[String]) -> Vec<f64>,
{
    pub fn new(predict_fn: F) -> Self {
        Self {
            predict_fn,
            num_classes: None,
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }
}

impl<F> Classifier for FnClassifier<F>
where
    F: Fn(&[String]) -> Vec<f64> + Send + Sync,
{
    fn predict(&self, batch: &[Vec<String>]) -> Result<Vec<Vec<f64>>, ModelError> {
        let mut outputs = Vec::with_capacity(batch.len());
        for (index, tokens) in batch.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| (self.predict_fn)(tokens.as_slice())));
            match result {
                Ok(output) => outputs.push(output),
                Err(panic_payload) => {
                    let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic type".to_string()
                    };
                    return Err(ModelError::Panicked { index, message });
                }
            }
        }
        validate_outputs(batch.len(), &outputs)?;
        Ok(outputs)
    }

    fn num_classes(&self) -> Option<usize> {
        self.num_classes
    }
}

/// Linear bag-of-words model: `softmax(bias + sum of word weights)`.
///
/// Stored as JSON:
/// `{"labels": ["negative", "positive"], "bias": [0.0, 0.0], "weights": {"great": [-1.0, 2.0]}}`.
/// Words are matched after [`normalize_word`]; unknown words contribute nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BagOfWordsClassifier {
    pub labels: Vec<String>,
    pub bias: Vec<f64>,
    pub weights: BTreeMap<String, Vec<f64>>,
}

impl BagOfWordsClassifier {
    pub fn new(
        labels: Vec<String>,
        bias: Vec<f64>,
        weights: BTreeMap<String, Vec<f64>>,
    ) -> Result<Self, ModelError> {
        let model = Self {
            labels,
            bias,
            weights: weights
                .into_iter()
                .map(|(word, w)| (normalize_word(&word), w))
                .collect(),
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), ModelError> {
        let invalid = |message: String| Err(ModelError::InvalidWeights { message });
        if self.labels.is_empty() {
            return invalid("model has no labels".to_string());
        }
        if self.bias.len() != self.labels.len() {
            return invalid(format!(
                "bias has {} entries for {} labels",
                self.bias.len(),
                self.labels.len()
            ));
        }
        for (word, w) in &self.weights {
            if w.len() != self.labels.len() {
                return invalid(format!(
                    "weights for '{word}' have {} entries for {} labels",
                    w.len(),
                    self.labels.len()
                ));
            }
        }
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ResourceError> {
        let file = File::open(path).map_err(|e| ResourceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let model: Self =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| ResourceError::Model {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::new(model.labels, model.bias, model.weights).map_err(|e| ResourceError::Model {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Words with explicit weights, in sorted order.
    pub fn vocabulary(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    pub fn label_name(&self, class: usize) -> Option<&str> {
        self.labels.get(class).map(String::as_str)
    }

    fn logits(&self, tokens: &[String]) -> Vec<f64> {
        let mut logits = self.bias.clone();
        for token in tokens {
            if let Some(w) = self.weights.get(&normalize_word(token)) {
                for (l, x) in logits.iter_mut().zip(w) {
                    *l += x;
                }
            }
        }
        logits
    }

    pub fn probabilities(&self, tokens: &[String]) -> Vec<f64> {
        softmax(&self.logits(tokens))
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl Classifier for BagOfWordsClassifier {
    fn predict(&self, batch: &[Vec<String>]) -> Result<Vec<Vec<f64>>, ModelError> {
        let outputs: Vec<Vec<f64>> = batch.iter().map(|t| self.probabilities(t)).collect();
        validate_outputs(batch.len(), &outputs)?;
        Ok(outputs)
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.labels.len())
    }
}

/// First-order (HotFlip) estimate of the cross-entropy change when the word at
/// `position` is swapped for each vocabulary word. For a linear model the
/// gradient of the loss w.r.t. the logits is `p - onehot(label)`.
impl GradientSignal for BagOfWordsClassifier {
    fn gradient_at(&self, tokens: &[String], position: usize, label: usize) -> Vec<(String, f64)> {
        let Some(current) = tokens.get(position) else {
            return Vec::new();
        };
        if label >= self.labels.len() {
            return Vec::new();
        }
        let mut grad = self.probabilities(tokens);
        grad[label] -= 1.0;

        let current = normalize_word(current);
        let zeros = vec![0.0; self.labels.len()];
        let current_w = self.weights.get(&current).unwrap_or(&zeros);

        let mut ranked: Vec<(String, f64)> = self
            .weights
            .iter()
            .filter(|(word, _)| **word != current)
            .map(|(word, w)| {
                let delta = grad
                    .iter()
                    .zip(w.iter().zip(current_w))
                    .map(|(g, (new, old))| g * (new - old))
                    .sum::<f64>();
                (word.clone(), delta)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}
