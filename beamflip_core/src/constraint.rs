//! Constraints filter candidates before they reach the oracle.

use crate::candidate::Candidate;
use crate::input::AttackInput;
use crate::resources::{EmbeddingTable, PosTagger};
use rayon::prelude::*;
use std::sync::Arc;

/// A predicate over (original input, candidate) pairs.
///
/// A resource miss (unknown word, untaggable token) must return `false`,
/// never panic.
pub trait Constraint: Send + Sync {
    fn name(&self) -> &'static str;

    fn allows(&self, original: &AttackInput, candidate: &Candidate) -> bool;

    /// Relative evaluation cost; cheaper constraints run first.
    fn cost(&self) -> u8 {
        0
    }
}

/// Conjunction of constraints, evaluated cheapest first with short-circuit.
#[derive(Default)]
pub struct ConstraintSet {
    constraints: Vec<Box<dyn Constraint>>,
}

impl ConstraintSet {
    pub fn new(mut constraints: Vec<Box<dyn Constraint>>) -> Self {
        constraints.sort_by_key(|c| c.cost());
        Self { constraints }
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constraints.iter().map(|c| c.name()).collect()
    }

    pub fn allows(&self, original: &AttackInput, candidate: &Candidate) -> bool {
        self.constraints
            .iter()
            .all(|c| c.allows(original, candidate))
    }

    /// Keeps the candidates every constraint allows, in their original order.
    pub fn filter(&self, original: &AttackInput, candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates
            .into_par_iter()
            .filter(|c| self.allows(original, c))
            .collect()
    }
}

/// At most `max_swaps` edits.
#[derive(Debug, Clone, Copy)]
pub struct MaxWordsSwapped {
    pub max_swaps: usize,
}

impl Constraint for MaxWordsSwapped {
    fn name(&self) -> &'static str {
        "MaxWordsSwapped"
    }

    fn allows(&self, _original: &AttackInput, candidate: &Candidate) -> bool {
        candidate.num_edits() <= self.max_swaps
    }
}

/// At most `max_fraction` of the tokens edited.
#[derive(Debug, Clone, Copy)]
pub struct MaxWordsPerturbed {
    pub max_fraction: f64,
}

impl Constraint for MaxWordsPerturbed {
    fn name(&self) -> &'static str {
        "MaxWordsPerturbed"
    }

    fn allows(&self, original: &AttackInput, candidate: &Candidate) -> bool {
        if original.is_empty() {
            return candidate.num_edits() == 0;
        }
        candidate.num_edits() as f64 / original.len() as f64 <= self.max_fraction
    }
}

/// Every replacement must stay within `min_cos_sim` of the word it replaced.
pub struct WordEmbeddingDistance {
    table: Arc<dyn EmbeddingTable>,
    min_cos_sim: f64,
}

impl WordEmbeddingDistance {
    pub fn new(table: Arc<dyn EmbeddingTable>, min_cos_sim: f64) -> Self {
        Self { table, min_cos_sim }
    }
}

impl Constraint for WordEmbeddingDistance {
    fn name(&self) -> &'static str {
        "WordEmbeddingDistance"
    }

    fn allows(&self, _original: &AttackInput, candidate: &Candidate) -> bool {
        candidate.edits().iter().all(|edit| {
            self.table
                .cosine_similarity(&edit.original, &edit.replacement)
                .is_some_and(|sim| sim >= self.min_cos_sim)
        })
    }

    fn cost(&self) -> u8 {
        1
    }
}

/// Every replacement must carry the same part-of-speech tag, in context, as
/// the word it replaced.
pub struct PartOfSpeech {
    tagger: Arc<dyn PosTagger>,
}

impl PartOfSpeech {
    pub fn new(tagger: Arc<dyn PosTagger>) -> Self {
        Self { tagger }
    }
}

impl Constraint for PartOfSpeech {
    fn name(&self) -> &'static str {
        "PartOfSpeech"
    }

    fn allows(&self, original: &AttackInput, candidate: &Candidate) -> bool {
        candidate.edits().iter().all(|edit| {
            let before = self.tagger.tag(original.tokens(), edit.position);
            let after = self.tagger.tag(candidate.tokens(), edit.position);
            matches!((before, after), (Some(a), Some(b)) if a == b)
        })
    }

    fn cost(&self) -> u8 {
        2
    }
}
