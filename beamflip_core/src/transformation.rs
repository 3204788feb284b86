//! Transformations propose the next-step candidates reachable by one word swap.

use crate::candidate::Candidate;
use crate::goal::GoalKind;
use crate::input::AttackInput;
use crate::resources::{EmbeddingTable, GradientSignal, default_stopwords, normalize_word};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Proposes candidates one atomic edit away from a parent.
///
/// Implementations are pure: every returned candidate differs from `candidate`
/// at exactly one position taken from `allowed`, and no two returned
/// candidates share a token sequence. An empty result is not an error.
pub trait Transformation: Send + Sync {
    fn name(&self) -> &'static str;

    fn expand(
        &self,
        input: &AttackInput,
        candidate: &Candidate,
        allowed: &BTreeSet<usize>,
    ) -> Vec<Candidate>;
}

/// Decides which of the allowed positions may be swapped at all.
#[derive(Debug, Clone)]
pub struct StopwordPolicy {
    replace_stopwords: bool,
    stopwords: HashSet<String>,
}

impl StopwordPolicy {
    pub fn new(replace_stopwords: bool) -> Self {
        Self {
            replace_stopwords,
            stopwords: default_stopwords(),
        }
    }

    pub fn with_stopwords(mut self, stopwords: HashSet<String>) -> Self {
        self.stopwords = stopwords;
        self
    }

    /// Positions of `allowed` that are in range, unedited, and (unless
    /// stopwords may be replaced) not stopwords.
    pub fn eligible_positions(&self, candidate: &Candidate, allowed: &BTreeSet<usize>) -> Vec<usize> {
        let tokens = candidate.tokens();
        allowed
            .iter()
            .copied()
            .filter(|&p| p < tokens.len() && !candidate.is_modified(p))
            .filter(|&p| {
                self.replace_stopwords || !self.stopwords.contains(&normalize_word(&tokens[p]))
            })
            .collect()
    }
}

impl Default for StopwordPolicy {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Pushes one child per replacement word, skipping no-op swaps and token
/// sequences already produced.
fn push_children<I>(
    parent: &Candidate,
    position: usize,
    replacements: I,
    limit: usize,
    seen: &mut HashSet<Vec<String>>,
    out: &mut Vec<Candidate>,
) where
    I: IntoIterator<Item = String>,
{
    let current = normalize_word(&parent.tokens()[position]);
    let mut produced = 0;
    for word in replacements {
        if produced >= limit {
            break;
        }
        if normalize_word(&word) == current {
            continue;
        }
        let Some(child) = parent.with_substitution(position, &word) else {
            continue;
        };
        if seen.insert(child.tokens().to_vec()) {
            out.push(child);
            produced += 1;
        }
    }
}

/// Supplies replacement words for one position.
pub trait SubstitutionSource: Send + Sync {
    fn substitutes(&self, tokens: &[String], position: usize) -> Vec<String>;
}

/// Every word of a fixed vocabulary, in vocabulary order.
#[derive(Debug, Clone)]
pub struct VocabularySource {
    words: Vec<String>,
}

impl VocabularySource {
    pub fn new(words: Vec<String>) -> Self {
        Self { words }
    }
}

impl SubstitutionSource for VocabularySource {
    fn substitutes(&self, _tokens: &[String], _position: usize) -> Vec<String> {
        self.words.clone()
    }
}

/// The nearest neighbours of the current word in embedding space.
pub struct EmbeddingNeighbors {
    table: Arc<dyn EmbeddingTable>,
    max_candidates: usize,
}

impl EmbeddingNeighbors {
    pub fn new(table: Arc<dyn EmbeddingTable>, max_candidates: usize) -> Self {
        Self {
            table,
            max_candidates,
        }
    }
}

impl SubstitutionSource for EmbeddingNeighbors {
    fn substitutes(&self, tokens: &[String], position: usize) -> Vec<String> {
        tokens
            .get(position)
            .map(|token| {
                self.table
                    .nearest_neighbors(token, self.max_candidates)
                    .into_iter()
                    .map(|(word, _)| word)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Black-box word swap: asks a [`SubstitutionSource`] for replacements at every
/// eligible position.
pub struct WordSwap {
    source: Box<dyn SubstitutionSource>,
    stopwords: StopwordPolicy,
    max_per_position: usize,
}

impl WordSwap {
    pub fn new(source: Box<dyn SubstitutionSource>, stopwords: StopwordPolicy) -> Self {
        Self {
            source,
            stopwords,
            max_per_position: usize::MAX,
        }
    }

    pub fn with_max_per_position(mut self, max_per_position: usize) -> Self {
        self.max_per_position = max_per_position;
        self
    }
}

impl Transformation for WordSwap {
    fn name(&self) -> &'static str {
        "WordSwap"
    }

    fn expand(
        &self,
        _input: &AttackInput,
        candidate: &Candidate,
        allowed: &BTreeSet<usize>,
    ) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for position in self.stopwords.eligible_positions(candidate, allowed) {
            let replacements = self.source.substitutes(candidate.tokens(), position);
            push_children(
                candidate,
                position,
                replacements,
                self.max_per_position,
                &mut seen,
                &mut out,
            );
        }
        out
    }
}

/// White-box word swap in the style of HotFlip: ranks substitutions by the
/// estimated loss change and keeps the top `k` per position. Untargeted goals
/// rank by loss increase for the ground truth, targeted goals by loss decrease
/// for the target class. Without a gradient signal it swaps in the whole
/// vocabulary.
pub struct GradientWordSwap {
    signal: Option<Arc<dyn GradientSignal>>,
    vocabulary: Vec<String>,
    top_k: usize,
    stopwords: StopwordPolicy,
    goal: GoalKind,
}

impl GradientWordSwap {
    pub fn new(
        signal: Option<Arc<dyn GradientSignal>>,
        vocabulary: Vec<String>,
        top_k: usize,
        stopwords: StopwordPolicy,
    ) -> Self {
        Self {
            signal,
            vocabulary,
            top_k,
            stopwords,
            goal: GoalKind::Untargeted,
        }
    }

    pub fn with_goal(mut self, goal: GoalKind) -> Self {
        self.goal = goal;
        self
    }

    pub fn is_exhaustive(&self) -> bool {
        self.signal.is_none()
    }

    /// Substitutions for `position`, most promising first.
    fn ranked(
        &self,
        signal: &dyn GradientSignal,
        input: &AttackInput,
        tokens: &[String],
        position: usize,
    ) -> Vec<String> {
        let ranked = match self.goal {
            GoalKind::Untargeted => signal.gradient_at(tokens, position, input.ground_truth()),
            GoalKind::Targeted { target_class } => {
                let mut ranked = signal.gradient_at(tokens, position, target_class);
                ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
                ranked
            }
        };
        ranked.into_iter().map(|(word, _)| word).collect()
    }
}

impl Transformation for GradientWordSwap {
    fn name(&self) -> &'static str {
        "GradientWordSwap"
    }

    fn expand(
        &self,
        input: &AttackInput,
        candidate: &Candidate,
        allowed: &BTreeSet<usize>,
    ) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for position in self.stopwords.eligible_positions(candidate, allowed) {
            match &self.signal {
                Some(signal) => {
                    let ranked = self.ranked(signal.as_ref(), input, candidate.tokens(), position);
                    push_children(
                        candidate,
                        position,
                        ranked,
                        self.top_k,
                        &mut seen,
                        &mut out,
                    );
                }
                None => push_children(
                    candidate,
                    position,
                    self.vocabulary.iter().cloned(),
                    usize::MAX,
                    &mut seen,
                    &mut out,
                ),
            }
        }
        out
    }
}
