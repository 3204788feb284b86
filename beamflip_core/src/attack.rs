//! An attack bundles a transformation, constraints, a goal and a search
//! strategy, and runs them against one input at a time.

use crate::candidate::{Candidate, Edit, ScoredCandidate};
use crate::constraint::ConstraintSet;
use crate::goal::{GoalError, GoalFunction, GoalKind};
use crate::input::AttackInput;
use crate::model::Classifier;
use crate::search::{CancelToken, SearchContext, SearchOutcome, SearchStrategy};
use crate::transformation::Transformation;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors that abort an attack invocation. An aborted invocation yields no
/// [`AttackResult`].
#[derive(Error, Debug)]
pub enum AttackError {
    #[error("attack aborted in round {round}: {source}")]
    Goal {
        round: usize,
        #[source]
        source: GoalError,
    },

    #[error("invalid attack configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum AttackStatus {
    /// A candidate reached the goal.
    Succeeded,
    /// The search space ran out without reaching the goal.
    Failed,
    /// The unmodified input already satisfies the goal; nothing was searched.
    Skipped,
    /// The query budget ran out or the attack was cancelled.
    MaxedOut,
}

/// Terminal record of one attack invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct AttackResult {
    pub status: AttackStatus,
    pub original: AttackInput,
    /// Best candidate found. `None` when skipped, or when the budget did not
    /// even allow scoring the original.
    pub perturbed: Option<Candidate>,
    pub original_label: Option<usize>,
    pub perturbed_label: Option<usize>,
    pub original_score: Option<f64>,
    pub perturbed_score: Option<f64>,
    /// Distinct token sequences sent to the oracle, the original included.
    pub query_count: usize,
    pub num_edits: usize,
    pub rounds: usize,
    /// Set for a targeted goal whose target equals the ground truth, so this
    /// skip is not mistaken for an already-misclassified input.
    pub trivially_complete: bool,
    /// Stopped by the cancel token before the search ran its course. Such a
    /// result is partial and is not kept in checkpoints.
    #[serde(default)]
    pub cancelled: bool,
    pub input_hash: String,
}

impl AttackResult {
    fn new(status: AttackStatus, original: &AttackInput, query_count: usize) -> Self {
        Self {
            status,
            original: original.clone(),
            perturbed: None,
            original_label: None,
            perturbed_label: None,
            original_score: None,
            perturbed_score: None,
            query_count,
            num_edits: 0,
            rounds: 0,
            trivially_complete: false,
            cancelled: false,
            input_hash: original.fingerprint(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttackStatus::Succeeded
    }

    pub fn perturbed_text(&self) -> Option<String> {
        self.perturbed.as_ref().map(Candidate::text)
    }

    pub fn edits(&self) -> &[Edit] {
        match &self.perturbed {
            Some(candidate) => candidate.edits(),
            None => &[],
        }
    }
}

pub struct Attack {
    transformation: Box<dyn Transformation>,
    constraints: ConstraintSet,
    goal: GoalKind,
    search: Box<dyn SearchStrategy>,
    query_budget: Option<usize>,
    batch_size: usize,
}

impl Attack {
    pub fn new(
        transformation: Box<dyn Transformation>,
        constraints: ConstraintSet,
        goal: GoalKind,
        search: Box<dyn SearchStrategy>,
    ) -> Self {
        Self {
            transformation,
            constraints,
            goal,
            search,
            query_budget: None,
            batch_size: 32,
        }
    }

    pub fn with_query_budget(mut self, query_budget: Option<usize>) -> Self {
        self.query_budget = query_budget;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn goal(&self) -> GoalKind {
        self.goal
    }

    pub fn query_budget(&self) -> Option<usize> {
        self.query_budget
    }

    /// One-line description, e.g. for logging the effective setup.
    pub fn describe(&self) -> String {
        format!(
            "{} + {} + [{}] + {:?}",
            self.search.name(),
            self.transformation.name(),
            self.constraints.names().join(", "),
            self.goal
        )
    }

    pub fn run(
        &self,
        classifier: &dyn Classifier,
        input: &AttackInput,
    ) -> Result<AttackResult, AttackError> {
        self.run_with_cancel(classifier, input, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &self,
        classifier: &dyn Classifier,
        input: &AttackInput,
        cancel: &CancelToken,
    ) -> Result<AttackResult, AttackError> {
        let at_setup = |source| AttackError::Goal { round: 0, source };
        let mut goal = GoalFunction::new(classifier, self.goal, input.ground_truth())
            .map_err(at_setup)?
            .with_query_budget(self.query_budget)
            .with_batch_size(self.batch_size);

        let Some(initial) = goal
            .evaluate(Candidate::identity(input))
            .map_err(at_setup)?
        else {
            return Ok(self.finish(AttackResult::new(AttackStatus::MaxedOut, input, 0)));
        };

        if initial.goal_achieved {
            let mut result = AttackResult::new(AttackStatus::Skipped, input, goal.num_queries());
            result.original_label = Some(initial.predicted_label);
            result.original_score = Some(initial.score);
            result.trivially_complete = self.goal.is_trivially_complete(input.ground_truth());
            return Ok(self.finish(result));
        }

        let ctx = SearchContext {
            input,
            transformation: self.transformation.as_ref(),
            constraints: &self.constraints,
            cancel,
        };
        let outcome = self.search.search(&ctx, &mut goal, initial.clone())?;
        Ok(self.finish(Self::result_from_outcome(
            input,
            &initial,
            outcome,
            goal.num_queries(),
        )))
    }

    fn result_from_outcome(
        input: &AttackInput,
        initial: &ScoredCandidate,
        outcome: SearchOutcome,
        query_count: usize,
    ) -> AttackResult {
        let mut result = AttackResult::new(outcome.status, input, query_count);
        result.original_label = Some(initial.predicted_label);
        result.original_score = Some(initial.score);
        result.perturbed_label = Some(outcome.best.predicted_label);
        result.perturbed_score = Some(outcome.best.score);
        result.num_edits = outcome.best.candidate.num_edits();
        result.rounds = outcome.rounds;
        result.cancelled = outcome.cancelled;
        result.perturbed = Some(outcome.best.candidate);
        result
    }

    fn finish(&self, result: AttackResult) -> AttackResult {
        info!(
            status = ?result.status,
            queries = result.query_count,
            edits = result.num_edits,
            rounds = result.rounds,
            input = %result.input_hash,
            "attack finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::MaxWordsSwapped;
    use crate::model::{FnClassifier, ModelError};
    use crate::search::BeamSearch;
    use crate::transformation::{StopwordPolicy, VocabularySource, WordSwap};
    use std::num::NonZeroUsize;

    fn attack(goal: GoalKind, words: &[&str]) -> Attack {
        Attack::new(
            Box::new(WordSwap::new(
                Box::new(VocabularySource::new(words.iter().map(|w| w.to_string()).collect())),
                StopwordPolicy::new(false),
            )),
            ConstraintSet::new(vec![Box::new(MaxWordsSwapped { max_swaps: 1 })]),
            goal,
            Box::new(BeamSearch::new(NonZeroUsize::new(4).unwrap())),
        )
    }

    /// Positive only while "great" is present.
    fn sentiment(tokens: &[String]) -> Vec<f64> {
        if tokens.iter().any(|t| t == "great") {
            vec![0.2, 0.8]
        } else {
            vec![0.9, 0.1]
        }
    }

    #[test]
    fn already_misclassified_input_is_skipped() {
        let classifier = FnClassifier::new(sentiment);
        let input = AttackInput::from_text("the movie was great", 0);
        let result = attack(GoalKind::Untargeted, &["terrible"])
            .run(&classifier, &input)
            .unwrap();
        assert_eq!(result.status, AttackStatus::Skipped);
        assert_eq!(result.query_count, 1);
        assert_eq!(result.num_edits, 0);
        assert!(result.perturbed.is_none());
        assert_eq!(result.perturbed_text(), None);
        assert!(!result.trivially_complete);
        assert_eq!(result.original_label, Some(1));
        assert!(result.original_score.is_some());
    }

    #[test]
    fn successful_attack_reports_edit_and_labels() {
        let classifier = FnClassifier::new(sentiment);
        let input = AttackInput::from_text("the movie was great", 1);
        let result = attack(GoalKind::Untargeted, &["terrible"])
            .run(&classifier, &input)
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.perturbed_text().as_deref(), Some("the movie was terrible"));
        assert_eq!(result.edits().len(), 1);
        assert_eq!(result.original_label, Some(1));
        assert_eq!(result.perturbed_label, Some(0));
        assert_eq!(result.input_hash, input.fingerprint());
        assert_eq!(result.rounds, 1);
    }

    #[test]
    fn zero_budget_yields_maxed_out_without_queries() {
        let classifier = FnClassifier::new(sentiment);
        let input = AttackInput::from_text("the movie was great", 1);
        let result = attack(GoalKind::Untargeted, &["terrible"])
            .with_query_budget(Some(0))
            .run(&classifier, &input)
            .unwrap();
        assert_eq!(result.status, AttackStatus::MaxedOut);
        assert_eq!(result.query_count, 0);
        assert!(result.perturbed.is_none());
    }

    #[test]
    fn oracle_failure_aborts_with_round_context() {
        let classifier = FnClassifier::new(|tokens: &[String]| {
            if tokens.iter().any(|t| t == "terrible") {
                vec![]
            } else {
                vec![0.2, 0.8]
            }
        });
        let input = AttackInput::from_text("the movie was great", 1);
        let err = attack(GoalKind::Untargeted, &["terrible"])
            .run(&classifier, &input)
            .unwrap_err();
        match err {
            AttackError::Goal {
                round,
                source: GoalError::Oracle { candidate, source },
            } => {
                assert_eq!(round, 1);
                assert_eq!(candidate, "the terrible was great");
                assert_eq!(source, ModelError::EmptyOutput { index: 0 });
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn describe_names_every_component() {
        let description = attack(GoalKind::Targeted { target_class: 0 }, &[]).describe();
        assert_eq!(
            description,
            "BeamSearch + WordSwap + [MaxWordsSwapped] + Targeted { target_class: 0 }"
        );
    }

    #[test]
    fn result_serializes_to_json() {
        let classifier = FnClassifier::new(sentiment);
        let input = AttackInput::from_text("the movie was great", 1);
        let result = attack(GoalKind::Untargeted, &["terrible"])
            .run(&classifier, &input)
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["num_edits"], 1);
        let back: AttackResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, result.status);
        assert_eq!(back.perturbed, result.perturbed);
    }
}
