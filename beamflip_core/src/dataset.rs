//! Examples to attack, read from JSON lines: `{"text": "...", "label": 1}`.

use crate::input::AttackInput;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset I/O error on {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Malformed example on line {line} of {path:?}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

#[derive(Deserialize)]
struct RawExample {
    text: String,
    label: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    examples: Vec<AttackInput>,
}

impl Dataset {
    pub fn new(examples: Vec<AttackInput>) -> Self {
        Self { examples }
    }

    /// Blank lines are ignored; examples whose text has no tokens are
    /// skipped with a warning since there is nothing to perturb.
    pub fn from_reader<R: BufRead>(reader: R, path: &Path) -> Result<Self, DatasetError> {
        let mut examples = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| DatasetError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawExample = serde_json::from_str(&line).map_err(|e| DatasetError::Parse {
                path: path.to_path_buf(),
                line: line_no + 1,
                message: e.to_string(),
            })?;
            let input = AttackInput::from_text(&raw.text, raw.label);
            if input.is_empty() {
                warn!(line = line_no + 1, path = ?path, "skipping example without tokens");
                continue;
            }
            examples.push(input);
        }
        Ok(Self { examples })
    }

    pub fn load_jsonl(path: &Path) -> Result<Self, DatasetError> {
        let file = File::open(path).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_reader(BufReader::new(file), path)
    }

    /// Deterministic shuffle for a given seed.
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.examples.shuffle(&mut rng);
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.examples.truncate(n);
        self
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&AttackInput> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[AttackInput] {
        &self.examples
    }
}
