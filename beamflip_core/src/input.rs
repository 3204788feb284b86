use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A tokenized text example together with the index of its ground-truth class.
///
/// Inputs are immutable once built; every perturbation is expressed as a
/// [`Candidate`](crate::candidate::Candidate) derived from one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct AttackInput {
    tokens: Vec<String>,
    ground_truth: usize,
}

impl AttackInput {
    pub fn new(tokens: Vec<String>, ground_truth: usize) -> Self {
        Self {
            tokens,
            ground_truth,
        }
    }

    /// Splits `text` on whitespace. Punctuation stays attached to its word.
    pub fn from_text(text: &str, ground_truth: usize) -> Self {
        Self::new(
            text.split_whitespace().map(str::to_string).collect(),
            ground_truth,
        )
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn ground_truth(&self) -> usize {
        self.ground_truth
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn text(&self) -> String {
        self.tokens.join(" ")
    }

    /// MD5 hex digest over the tokens and label, used to identify an input
    /// across runs (result files, checkpoints).
    pub fn fingerprint(&self) -> String {
        let mut context = md5::Context::new();
        for token in &self.tokens {
            context.consume(token.as_bytes());
            context.consume([0u8]);
        }
        context.consume(self.ground_truth.to_le_bytes());
        format!("{:x}", context.compute())
    }
}
