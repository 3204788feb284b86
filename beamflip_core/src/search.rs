//! Search strategies drive expansion, filtering, scoring and pruning.

use crate::attack::{AttackError, AttackStatus};
use crate::candidate::{Candidate, ScoredCandidate};
use crate::constraint::ConstraintSet;
use crate::goal::GoalFunction;
use crate::input::AttackInput;
use crate::transformation::Transformation;
use rayon::prelude::*;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Shared flag for stopping an attack from outside. Checked at the start of
/// every search round.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The fixed pieces of one attack invocation a strategy works with.
pub struct SearchContext<'a> {
    pub input: &'a AttackInput,
    pub transformation: &'a dyn Transformation,
    pub constraints: &'a ConstraintSet,
    pub cancel: &'a CancelToken,
}

/// How a search ended. `best` is the winning candidate for `Succeeded` and
/// the highest-scoring candidate seen otherwise.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub status: AttackStatus,
    pub best: ScoredCandidate,
    /// Rounds in which at least one candidate was scored.
    pub rounds: usize,
    /// The search stopped on the cancel token, so `best` is a partial answer.
    pub cancelled: bool,
}

/// Explores multi-edit perturbations starting from the scored original input.
///
/// Implementations must terminate, must only hand constraint-approved
/// candidates to `goal`, and must only report `Succeeded` for a candidate the
/// goal function marked as achieved.
pub trait SearchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn search(
        &self,
        ctx: &SearchContext<'_>,
        goal: &mut GoalFunction<'_>,
        initial: ScoredCandidate,
    ) -> Result<SearchOutcome, AttackError>;
}

/// Beam ranking: higher score first, then fewer edits. Used with a stable
/// sort so discovery order breaks the remaining ties.
fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> CmpOrdering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.candidate.num_edits().cmp(&b.candidate.num_edits()))
}

/// Keeps the `beam_width` best candidates between rounds.
#[derive(Debug, Clone, Copy)]
pub struct BeamSearch {
    beam_width: NonZeroUsize,
}

impl BeamSearch {
    pub fn new(beam_width: NonZeroUsize) -> Self {
        Self { beam_width }
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width.get()
    }

    /// Union of one-edit expansions of every beam member, deduplicated by
    /// token sequence, in beam order.
    fn expand(&self, ctx: &SearchContext<'_>, beam: &[ScoredCandidate]) -> Vec<Candidate> {
        let per_member: Vec<Vec<Candidate>> = beam
            .par_iter()
            .map(|member| {
                let allowed = member.candidate.unmodified_positions();
                ctx.transformation
                    .expand(ctx.input, &member.candidate, &allowed)
            })
            .collect();
        let mut seen = HashSet::new();
        per_member
            .into_iter()
            .flatten()
            .filter(|c| seen.insert(c.tokens().to_vec()))
            .collect()
    }
}

impl SearchStrategy for BeamSearch {
    fn name(&self) -> &'static str {
        "BeamSearch"
    }

    fn search(
        &self,
        ctx: &SearchContext<'_>,
        goal: &mut GoalFunction<'_>,
        initial: ScoredCandidate,
    ) -> Result<SearchOutcome, AttackError> {
        let mut best = initial.clone();
        let mut beam = vec![initial];
        let mut rounds = 0;
        let finish = |status: AttackStatus,
                      best: ScoredCandidate,
                      rounds: usize|
         -> Result<SearchOutcome, AttackError> {
            Ok(SearchOutcome {
                status,
                best,
                rounds,
                cancelled: false,
            })
        };

        loop {
            if ctx.cancel.is_cancelled() {
                warn!(round = rounds + 1, "attack cancelled");
                return Ok(SearchOutcome {
                    status: AttackStatus::MaxedOut,
                    best,
                    rounds,
                    cancelled: true,
                });
            }
            if goal.budget_exhausted() {
                return finish(AttackStatus::MaxedOut, best, rounds);
            }
            let round = rounds + 1;

            let expanded = self.expand(ctx, &beam);
            let expanded_len = expanded.len();
            let survivors = ctx.constraints.filter(ctx.input, expanded);
            debug!(
                round,
                beam = beam.len(),
                expanded = expanded_len,
                survivors = survivors.len(),
                "beam search round"
            );
            if survivors.is_empty() {
                return finish(AttackStatus::Failed, best, rounds);
            }

            let batch = goal
                .evaluate_batch(survivors)
                .map_err(|source| AttackError::Goal { round, source })?;
            if !batch.scored.is_empty() {
                rounds = round;
            }

            let winner = batch
                .scored
                .iter()
                .filter(|s| s.goal_achieved)
                .fold(None, |acc: Option<&ScoredCandidate>, s| match acc {
                    Some(kept) if kept.score >= s.score => Some(kept),
                    _ => Some(s),
                });
            if let Some(winner) = winner {
                return finish(AttackStatus::Succeeded, winner.clone(), rounds);
            }

            for scored in &batch.scored {
                if scored.score > best.score {
                    best = scored.clone();
                }
            }
            if batch.budget_exhausted {
                return finish(AttackStatus::MaxedOut, best, rounds);
            }

            let mut next = batch.scored;
            next.sort_by(rank);
            next.truncate(self.beam_width.get());
            if next
                .iter()
                .all(|member| member.candidate.unmodified_positions().is_empty())
            {
                return finish(AttackStatus::Failed, best, rounds);
            }
            beam = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::MaxWordsSwapped;
    use crate::goal::GoalKind;
    use crate::model::FnClassifier;
    use crate::transformation::{StopwordPolicy, VocabularySource, WordSwap};

    fn scored(input: &AttackInput, swaps: &[(usize, &str)], score: f64) -> ScoredCandidate {
        let candidate = swaps.iter().fold(Candidate::identity(input), |c, (p, w)| {
            c.with_substitution(*p, w).unwrap()
        });
        ScoredCandidate {
            candidate,
            score,
            goal_achieved: false,
            predicted_label: 0,
        }
    }

    fn vocabulary_swap(words: &[&str]) -> WordSwap {
        WordSwap::new(
            Box::new(VocabularySource::new(words.iter().map(|w| w.to_string()).collect())),
            StopwordPolicy::new(true),
        )
    }

    #[test]
    fn rank_orders_by_score_then_edit_count() {
        let input = AttackInput::from_text("a b c", 0);
        let mut items = vec![
            scored(&input, &[(0, "x"), (1, "y")], 0.5),
            scored(&input, &[(2, "z")], 0.5),
            scored(&input, &[(0, "q")], 0.9),
            scored(&input, &[(1, "r")], 0.5),
        ];
        items.sort_by(rank);
        let texts: Vec<String> = items.iter().map(|s| s.candidate.text()).collect();
        assert_eq!(texts, vec!["q b c", "a b z", "a r c", "x y c"]);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn beam_search_needs_two_rounds_for_two_word_flip() {
        // Flips only when both "x" and "y" are present.
        let classifier = FnClassifier::new(|tokens: &[String]| {
            let has_x = tokens.iter().any(|t| t == "x");
            let has_y = tokens.iter().any(|t| t == "y");
            match (has_x, has_y) {
                (true, true) => vec![0.9, 0.1],
                (false, false) => vec![0.2, 0.8],
                _ => vec![0.3, 0.7],
            }
        });
        let input = AttackInput::from_text("a b", 1);
        let transformation = vocabulary_swap(&["x", "y"]);
        let constraints = ConstraintSet::new(vec![Box::new(MaxWordsSwapped { max_swaps: 2 })]);
        let cancel = CancelToken::new();
        let ctx = SearchContext {
            input: &input,
            transformation: &transformation,
            constraints: &constraints,
            cancel: &cancel,
        };
        let mut goal = GoalFunction::new(&classifier, GoalKind::Untargeted, 1).unwrap();
        let initial = goal.evaluate(Candidate::identity(&input)).unwrap().unwrap();

        let outcome = BeamSearch::new(NonZeroUsize::new(2).unwrap())
            .search(&ctx, &mut goal, initial)
            .unwrap();
        assert_eq!(outcome.status, AttackStatus::Succeeded);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.best.candidate.num_edits(), 2);
        assert!(outcome.best.goal_achieved);
        assert_eq!(outcome.best.candidate.text(), "x y");
    }

    #[test]
    fn cancelled_search_reports_maxed_out_without_querying() {
        let classifier = FnClassifier::new(|_: &[String]| vec![0.2, 0.8]);
        let input = AttackInput::from_text("a b", 1);
        let transformation = vocabulary_swap(&["x"]);
        let constraints = ConstraintSet::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = SearchContext {
            input: &input,
            transformation: &transformation,
            constraints: &constraints,
            cancel: &cancel,
        };
        let mut goal = GoalFunction::new(&classifier, GoalKind::Untargeted, 1).unwrap();
        let initial = goal.evaluate(Candidate::identity(&input)).unwrap().unwrap();
        let outcome = BeamSearch::new(NonZeroUsize::new(3).unwrap())
            .search(&ctx, &mut goal, initial.clone())
            .unwrap();
        assert_eq!(outcome.status, AttackStatus::MaxedOut);
        assert!(outcome.cancelled);
        assert_eq!(outcome.best, initial);
        assert_eq!(outcome.rounds, 0);
        assert_eq!(goal.num_queries(), 1);
    }

    #[test]
    fn cancel_between_rounds_keeps_best_so_far() {
        // "x y" would flip in round 2; the token is cancelled while round 1 is scored.
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let classifier = FnClassifier::new(move |tokens: &[String]| {
            let has_x = tokens.iter().any(|t| t == "x");
            let has_y = tokens.iter().any(|t| t == "y");
            if has_x || has_y {
                trigger.cancel();
            }
            match (has_x, has_y) {
                (true, true) => vec![0.9, 0.1],
                (true, false) => vec![0.3, 0.7],
                (false, true) => vec![0.4, 0.6],
                (false, false) => vec![0.2, 0.8],
            }
        });
        let input = AttackInput::from_text("a b", 1);
        let transformation = vocabulary_swap(&["x", "y"]);
        let constraints = ConstraintSet::new(vec![Box::new(MaxWordsSwapped { max_swaps: 2 })]);
        let ctx = SearchContext {
            input: &input,
            transformation: &transformation,
            constraints: &constraints,
            cancel: &cancel,
        };
        let mut goal = GoalFunction::new(&classifier, GoalKind::Untargeted, 1).unwrap();
        let initial = goal.evaluate(Candidate::identity(&input)).unwrap().unwrap();
        assert!(!cancel.is_cancelled());

        let outcome = BeamSearch::new(NonZeroUsize::new(2).unwrap())
            .search(&ctx, &mut goal, initial)
            .unwrap();
        assert_eq!(outcome.status, AttackStatus::MaxedOut, "never Succeeded after cancel");
        assert!(outcome.cancelled);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.best.candidate.text(), "y b");
        assert!(!outcome.best.goal_achieved);
        assert_eq!(goal.num_queries(), 5, "original plus the four round-1 children");
    }
}
