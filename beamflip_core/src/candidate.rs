use crate::input::AttackInput;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One word substitution applied to a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Edit {
    pub position: usize,
    pub original: String,
    pub replacement: String,
}

/// A perturbed version of an [`AttackInput`] plus the edits that produced it.
///
/// Candidates are only built through [`Candidate::identity`] and
/// [`Candidate::with_substitution`], so `indices_modified` is always exactly the
/// set of positions named in `edits`, and no position is edited twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Candidate {
    tokens: Vec<String>,
    edits: Vec<Edit>,
    indices_modified: BTreeSet<usize>,
}

impl Candidate {
    /// The unmodified input, with an empty edit history.
    pub fn identity(input: &AttackInput) -> Self {
        Self {
            tokens: input.tokens().to_vec(),
            edits: Vec::new(),
            indices_modified: BTreeSet::new(),
        }
    }

    /// Returns a child candidate with the token at `position` replaced.
    ///
    /// Returns `None` when `position` is out of range, was already edited, or
    /// `replacement` equals the current token, since none of those is an edit.
    pub fn with_substitution(&self, position: usize, replacement: &str) -> Option<Self> {
        let current = self.tokens.get(position)?;
        if self.indices_modified.contains(&position) || current == replacement {
            return None;
        }
        let mut child = self.clone();
        child.edits.push(Edit {
            position,
            original: current.clone(),
            replacement: replacement.to_string(),
        });
        child.tokens[position] = replacement.to_string();
        child.indices_modified.insert(position);
        Some(child)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    pub fn indices_modified(&self) -> &BTreeSet<usize> {
        &self.indices_modified
    }

    pub fn num_edits(&self) -> usize {
        self.edits.len()
    }

    pub fn is_modified(&self, position: usize) -> bool {
        self.indices_modified.contains(&position)
    }

    /// Positions that can still take an edit.
    pub fn unmodified_positions(&self) -> BTreeSet<usize> {
        (0..self.tokens.len())
            .filter(|i| !self.indices_modified.contains(i))
            .collect()
    }

    pub fn text(&self) -> String {
        self.tokens.join(" ")
    }
}

/// A candidate after the goal function has scored it. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Higher is closer to the goal.
    pub score: f64,
    pub goal_achieved: bool,
    /// Argmax class of the oracle output.
    pub predicted_label: usize,
}
