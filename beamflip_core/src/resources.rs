//! Read-only linguistic resources consumed by transformations and constraints.
//!
//! Resources are loaded once and shared (behind `Arc`) by every attack
//! invocation. A lookup miss is reported as `None`; callers decide what a miss
//! means (constraints treat it as "disallowed").

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading resource files. Lookups never fail.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Failed to read resource file {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Malformed line {line} in {path:?}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Embedding for '{word}' has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        word: String,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed model file {path:?}: {message}")]
    Model { path: PathBuf, message: String },
}

/// Word embedding lookup.
pub trait EmbeddingTable: Send + Sync {
    /// The vector for `token`, or `None` if the table does not cover it.
    fn embedding(&self, token: &str) -> Option<&[f64]>;

    /// Up to `k` other words ordered by decreasing cosine similarity to `token`.
    fn nearest_neighbors(&self, token: &str, k: usize) -> Vec<(String, f64)>;

    fn cosine_similarity(&self, a: &str, b: &str) -> Option<f64> {
        cosine(self.embedding(a)?, self.embedding(b)?)
    }
}

/// Part-of-speech tagging of one token in the context of its sentence.
pub trait PosTagger: Send + Sync {
    fn tag(&self, tokens: &[String], position: usize) -> Option<String>;
}

/// Pluggable estimate of how much each substitution at a position would
/// increase the classifier's loss for `label`.
pub trait GradientSignal: Send + Sync {
    /// Substitutions for `position`, best (largest estimated loss increase) first.
    fn gradient_at(&self, tokens: &[String], position: usize, label: usize) -> Vec<(String, f64)>;
}

/// Cosine similarity, `None` for mismatched lengths or zero vectors.
pub fn cosine(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// Strips surrounding punctuation and lowercases, the key form used by the
/// in-memory resources.
pub fn normalize_word(token: &str) -> String {
    token
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

/// Embeddings held in memory, loadable from a GloVe-style text file
/// (`word v1 v2 ... vn` per line).
#[derive(Debug, Default, Clone)]
pub struct InMemoryEmbeddings {
    words: Vec<String>,
    vectors: Vec<Vec<f64>>,
    index: HashMap<String, usize>,
}

impl InMemoryEmbeddings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.vectors.first().map(Vec::len)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Adds or replaces the vector for `word` (stored normalized).
    pub fn insert(&mut self, word: &str, vector: Vec<f64>) -> Result<(), ResourceError> {
        let key = normalize_word(word);
        if let Some(expected) = self.dimension() {
            if vector.len() != expected {
                return Err(ResourceError::DimensionMismatch {
                    word: key,
                    expected,
                    actual: vector.len(),
                });
            }
        }
        match self.index.get(&key) {
            Some(&i) => self.vectors[i] = vector,
            None => {
                self.index.insert(key.clone(), self.words.len());
                self.words.push(key);
                self.vectors.push(vector);
            }
        }
        Ok(())
    }

    pub fn from_reader<R: BufRead>(reader: R, path: &Path) -> Result<Self, ResourceError> {
        let mut table = Self::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ResourceError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else {
                continue;
            };
            let vector = fields
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ResourceError::Parse {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    message: format!("bad vector component for '{word}': {e}"),
                })?;
            if vector.is_empty() {
                return Err(ResourceError::Parse {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    message: format!("no vector for '{word}'"),
                });
            }
            table.insert(word, vector)?;
        }
        Ok(table)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ResourceError> {
        let file = File::open(path).map_err(|e| ResourceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl EmbeddingTable for InMemoryEmbeddings {
    fn embedding(&self, token: &str) -> Option<&[f64]> {
        self.index
            .get(&normalize_word(token))
            .map(|&i| self.vectors[i].as_slice())
    }

    fn nearest_neighbors(&self, token: &str, k: usize) -> Vec<(String, f64)> {
        let key = normalize_word(token);
        let Some(&own) = self.index.get(&key) else {
            return Vec::new();
        };
        let query = &self.vectors[own];
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != own)
            .filter_map(|(i, v)| cosine(query, v).map(|sim| (i, sim)))
            .collect();
        // Stable sort keeps file order among equal similarities.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(i, sim)| (self.words[i].clone(), sim))
            .collect()
    }
}

/// Context-free tagger backed by a `word<TAB>tag` lexicon.
#[derive(Debug, Default, Clone)]
pub struct LexiconTagger {
    lexicon: HashMap<String, String>,
}

impl LexiconTagger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, word: &str, tag: &str) {
        self.lexicon.insert(normalize_word(word), tag.to_string());
    }

    pub fn len(&self) -> usize {
        self.lexicon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lexicon.is_empty()
    }

    /// Blank lines and lines starting with `#` are ignored.
    pub fn from_reader<R: BufRead>(reader: R, path: &Path) -> Result<Self, ResourceError> {
        let mut tagger = Self::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ResourceError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match trimmed.split_once('\t') {
                Some((word, tag)) if !word.trim().is_empty() && !tag.trim().is_empty() => {
                    tagger.insert(word.trim(), tag.trim());
                }
                _ => {
                    return Err(ResourceError::Parse {
                        path: path.to_path_buf(),
                        line: line_no + 1,
                        message: "expected 'word<TAB>tag'".to_string(),
                    });
                }
            }
        }
        Ok(tagger)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ResourceError> {
        let file = File::open(path).map_err(|e| ResourceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl PosTagger for LexiconTagger {
    fn tag(&self, tokens: &[String], position: usize) -> Option<String> {
        let token = tokens.get(position)?;
        self.lexicon.get(&normalize_word(token)).cloned()
    }
}

pub const DEFAULT_STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];

pub fn default_stopwords() -> HashSet<String> {
    DEFAULT_STOPWORDS.iter().map(|w| w.to_string()).collect()
}

/// Reads one word per line, ignoring blank lines and `#` comments.
pub fn load_word_list(path: &Path) -> Result<HashSet<String>, ResourceError> {
    let file = File::open(path).map_err(|e| ResourceError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut words = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ResourceError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let word = line.trim();
        if !word.is_empty() && !word.starts_with('#') {
            words.insert(normalize_word(word));
        }
    }
    Ok(words)
}
