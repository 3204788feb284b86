//! Goal functions turn oracle output into a ranking score and a success decision.

use crate::candidate::{Candidate, ScoredCandidate};
use crate::model::{Classifier, ModelError, argmax, validate_outputs};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GoalError {
    #[error("target class set to {target_class} with {num_classes} classes")]
    InvalidTargetClass {
        target_class: usize,
        num_classes: usize,
    },

    #[error("ground-truth label {label} is outside the classifier's {num_classes} classes")]
    InvalidGroundTruth { label: usize, num_classes: usize },

    #[error("oracle call failed on '{candidate}': {source}")]
    Oracle {
        candidate: String,
        #[source]
        source: ModelError,
    },
}

/// What counts as a successful attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalKind {
    /// Any label other than the ground truth. Score: `1 - p(ground truth)`.
    #[default]
    Untargeted,
    /// Reach `target_class`. Score: `p(target_class)`.
    Targeted {
        #[serde(rename = "target-class")]
        target_class: usize,
    },
}

impl GoalKind {
    pub fn validate(&self, num_classes: usize, ground_truth: usize) -> Result<(), GoalError> {
        if let GoalKind::Targeted { target_class } = *self {
            if target_class >= num_classes {
                return Err(GoalError::InvalidTargetClass {
                    target_class,
                    num_classes,
                });
            }
        }
        if ground_truth >= num_classes {
            return Err(GoalError::InvalidGroundTruth {
                label: ground_truth,
                num_classes,
            });
        }
        Ok(())
    }

    /// Callers must [`validate`](Self::validate) against `output.len()` first.
    pub fn score(&self, output: &[f64], ground_truth: usize) -> f64 {
        match *self {
            GoalKind::Untargeted => 1.0 - output[ground_truth],
            GoalKind::Targeted { target_class } => output[target_class],
        }
    }

    pub fn is_complete(&self, output: &[f64], ground_truth: usize) -> bool {
        let predicted = argmax(output);
        match *self {
            GoalKind::Untargeted => predicted != ground_truth,
            GoalKind::Targeted { target_class } => {
                predicted == target_class || self.is_trivially_complete(ground_truth)
            }
        }
    }

    /// A targeted goal whose target is the ground truth is met by the
    /// unmodified input; no perturbation is ever needed.
    pub fn is_trivially_complete(&self, ground_truth: usize) -> bool {
        matches!(*self, GoalKind::Targeted { target_class } if target_class == ground_truth)
    }
}

#[derive(Debug, Clone, Copy)]
struct Evaluation {
    score: f64,
    goal_achieved: bool,
    predicted_label: usize,
}

/// Outcome of scoring a batch.
#[derive(Debug, Clone)]
pub struct BatchEvaluation {
    /// Scored candidates in submission order.
    pub scored: Vec<ScoredCandidate>,
    /// Set when some candidates were dropped unscored for lack of query budget.
    pub budget_exhausted: bool,
}

/// Scores candidates for one attack invocation.
///
/// Every distinct token sequence is sent to the oracle at most once; the
/// cache lives exactly as long as the invocation, so `num_queries` is the
/// number of distinct sequences the oracle has seen.
pub struct GoalFunction<'a> {
    classifier: &'a dyn Classifier,
    kind: GoalKind,
    ground_truth: usize,
    cache: HashMap<Vec<String>, Evaluation>,
    query_budget: Option<usize>,
    batch_size: usize,
}

impl<'a> GoalFunction<'a> {
    /// Fails fast when the classifier reports its class count and the goal
    /// does not fit it; otherwise validation happens on the first oracle output.
    pub fn new(
        classifier: &'a dyn Classifier,
        kind: GoalKind,
        ground_truth: usize,
    ) -> Result<Self, GoalError> {
        if let Some(num_classes) = classifier.num_classes() {
            kind.validate(num_classes, ground_truth)?;
        }
        Ok(Self {
            classifier,
            kind,
            ground_truth,
            cache: HashMap::new(),
            query_budget: None,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_query_budget(mut self, query_budget: Option<usize>) -> Self {
        self.query_budget = query_budget;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn kind(&self) -> GoalKind {
        self.kind
    }

    pub fn ground_truth(&self) -> usize {
        self.ground_truth
    }

    pub fn num_queries(&self) -> usize {
        self.cache.len()
    }

    pub fn remaining_queries(&self) -> Option<usize> {
        self.query_budget
            .map(|budget| budget.saturating_sub(self.num_queries()))
    }

    pub fn budget_exhausted(&self) -> bool {
        self.remaining_queries() == Some(0)
    }

    /// Scores one candidate; `None` when the budget does not allow a new query.
    pub fn evaluate(&mut self, candidate: Candidate) -> Result<Option<ScoredCandidate>, GoalError> {
        Ok(self.evaluate_batch(vec![candidate])?.scored.into_iter().next())
    }

    /// Scores `candidates`, querying the oracle only for sequences not seen
    /// before, in batches of at most `batch_size`. New sequences beyond the
    /// remaining budget are dropped, earliest submitted first kept.
    pub fn evaluate_batch(&mut self, candidates: Vec<Candidate>) -> Result<BatchEvaluation, GoalError> {
        let remaining = self.remaining_queries();
        let mut pending: Vec<Vec<String>> = Vec::new();
        let mut pending_set: HashSet<Vec<String>> = HashSet::new();
        let mut admitted = Vec::with_capacity(candidates.len());
        let mut budget_exhausted = false;

        for candidate in candidates {
            let tokens = candidate.tokens();
            if self.cache.contains_key(tokens) || pending_set.contains(tokens) {
                admitted.push(candidate);
                continue;
            }
            if remaining.is_some_and(|r| pending.len() >= r) {
                budget_exhausted = true;
                continue;
            }
            pending_set.insert(tokens.to_vec());
            pending.push(tokens.to_vec());
            admitted.push(candidate);
        }

        for chunk in pending.chunks(self.batch_size) {
            self.query(chunk)?;
        }

        let scored = admitted
            .into_iter()
            .filter_map(|candidate| {
                let eval = *self.cache.get(candidate.tokens())?;
                Some(ScoredCandidate {
                    candidate,
                    score: eval.score,
                    goal_achieved: eval.goal_achieved,
                    predicted_label: eval.predicted_label,
                })
            })
            .collect();

        Ok(BatchEvaluation {
            scored,
            budget_exhausted,
        })
    }

    fn query(&mut self, chunk: &[Vec<String>]) -> Result<(), GoalError> {
        debug!(batch = chunk.len(), "querying oracle");
        let oracle_error = |source: ModelError| {
            let index = source.batch_index().unwrap_or(0).min(chunk.len() - 1);
            GoalError::Oracle {
                candidate: chunk[index].join(" "),
                source,
            }
        };
        let outputs = self.classifier.predict(chunk).map_err(oracle_error)?;
        validate_outputs(chunk.len(), &outputs).map_err(oracle_error)?;

        for (tokens, output) in chunk.iter().zip(&outputs) {
            self.kind.validate(output.len(), self.ground_truth)?;
            let eval = Evaluation {
                score: self.kind.score(output, self.ground_truth),
                goal_achieved: self.kind.is_complete(output, self.ground_truth),
                predicted_label: argmax(output),
            };
            self.cache.insert(tokens.clone(), eval);
        }
        Ok(())
    }
}
