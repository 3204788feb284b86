//! Runs one attack over many inputs on worker threads.
//!
//! Invocations are independent: they share the read-only attack, classifier
//! and resources, and nothing else except [`RunnerStats`], whose counters are
//! atomic. Results come back in dataset order whatever the thread count.

use crate::attack::{Attack, AttackResult, AttackStatus};
use crate::dataset::Dataset;
use crate::model::Classifier;
use crate::search::CancelToken;
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    decode_from_slice, encode_to_vec,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Checkpoint I/O error on {path:?}: {message}")]
    CheckpointIo { path: PathBuf, message: String },

    #[error("Checkpoint {path:?} is corrupt: {message}")]
    CheckpointCorrupt { path: PathBuf, message: String },

    #[error("Checkpoint {path:?} was written for config {found}, current config is {expected}")]
    ConfigMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Checkpoint {path:?} covers a dataset of {found} examples, current dataset has {expected}")]
    DatasetMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

/// Outcome of attacking one dataset example.
#[derive(Debug, Clone, PartialEq, Serialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum RunEntry {
    Completed(AttackResult),
    /// The invocation aborted (oracle failure, bad configuration for this
    /// input); distinct from a `Failed` or `MaxedOut` result.
    Errored { input_hash: String, message: String },
}

impl RunEntry {
    pub fn result(&self) -> Option<&AttackResult> {
        match self {
            RunEntry::Completed(result) => Some(result),
            RunEntry::Errored { .. } => None,
        }
    }

    /// Cut short by cancellation; the input still has to be attacked.
    pub fn is_interrupted(&self) -> bool {
        self.result().is_some_and(|r| r.cancelled)
    }
}

#[derive(Debug, Default)]
pub struct RunnerStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    maxed_out: AtomicU64,
    errored: AtomicU64,
    queries: AtomicU64,
}

impl RunnerStats {
    pub fn record(&self, entry: &RunEntry) {
        let counter = match entry {
            RunEntry::Completed(result) => {
                self.queries
                    .fetch_add(result.query_count as u64, Ordering::Relaxed);
                match result.status {
                    AttackStatus::Succeeded => &self.succeeded,
                    AttackStatus::Failed => &self.failed,
                    AttackStatus::Skipped => &self.skipped,
                    AttackStatus::MaxedOut => &self.maxed_out,
                }
            }
            RunEntry::Errored { .. } => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            maxed_out: self.maxed_out.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub maxed_out: u64,
    pub errored: u64,
    pub queries: u64,
}

impl StatsSnapshot {
    /// Inputs that were actually searched (not skipped, not errored).
    pub fn attacked(&self) -> u64 {
        self.succeeded + self.failed + self.maxed_out
    }

    pub fn success_rate(&self) -> Option<f64> {
        match self.attacked() {
            0 => None,
            n => Some(self.succeeded as f64 / n as f64),
        }
    }

    pub fn completed(&self) -> u64 {
        self.attacked() + self.skipped
    }

    pub fn avg_queries(&self) -> Option<f64> {
        match self.completed() {
            0 => None,
            n => Some(self.queries as f64 / n as f64),
        }
    }
}

/// Completed entries of an interrupted run, persisted with bincode.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Checkpoint {
    pub config_hash: String,
    pub dataset_len: usize,
    pub entries: Vec<(usize, RunEntry)>,
}

impl Checkpoint {
    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Written to a temporary file next to `path`, then renamed over it, so
    /// a crash mid-write leaves the previous checkpoint intact.
    pub fn save(&self, path: &Path) -> Result<(), RunnerError> {
        let io_err = |e: &dyn std::fmt::Display| RunnerError::CheckpointIo {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let bytes = encode_to_vec(self, Self::bincode_config()).map_err(|e| {
            RunnerError::CheckpointCorrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err(&e))?;
        tmp.write_all(&bytes).map_err(|e| io_err(&e))?;
        tmp.persist(path).map_err(|e| io_err(&e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let bytes = std::fs::read(path).map_err(|e| RunnerError::CheckpointIo {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let (checkpoint, _) = decode_from_slice::<Self, _>(&bytes, Self::bincode_config())
            .map_err(|e| RunnerError::CheckpointCorrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(checkpoint)
    }
}

/// Where and how often to checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub path: PathBuf,
    pub interval: usize,
    /// Fingerprint of the configuration; a checkpoint from another config is refused.
    pub config_hash: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// `(dataset index, entry)` in dataset order. Inputs not reached before
    /// cancellation are absent; inputs whose attack was cut short are present
    /// with `cancelled` set.
    pub entries: Vec<(usize, RunEntry)>,
    /// Counts finished entries only.
    pub stats: StatsSnapshot,
    /// Entries cut short by cancellation. Left out of the checkpoint, so a
    /// resumed run attacks them again.
    pub interrupted: usize,
    /// Entries restored from a checkpoint rather than attacked in this run.
    pub resumed: usize,
}

pub struct AttackRunner<'a> {
    attack: &'a Attack,
    classifier: &'a dyn Classifier,
    threads: usize,
    cancel: CancelToken,
    checkpoint: Option<CheckpointPolicy>,
}

impl<'a> AttackRunner<'a> {
    pub fn new(attack: &'a Attack, classifier: &'a dyn Classifier) -> Self {
        Self {
            attack,
            classifier,
            threads: 1,
            cancel: CancelToken::new(),
            checkpoint: None,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointPolicy) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    fn restore(&self, dataset: &Dataset) -> Result<BTreeMap<usize, RunEntry>, RunnerError> {
        let Some(policy) = &self.checkpoint else {
            return Ok(BTreeMap::new());
        };
        if !policy.path.exists() {
            return Ok(BTreeMap::new());
        }
        let checkpoint = Checkpoint::load(&policy.path)?;
        if checkpoint.config_hash != policy.config_hash {
            return Err(RunnerError::ConfigMismatch {
                path: policy.path.clone(),
                expected: policy.config_hash.clone(),
                found: checkpoint.config_hash,
            });
        }
        if checkpoint.dataset_len != dataset.len() {
            return Err(RunnerError::DatasetMismatch {
                path: policy.path.clone(),
                expected: dataset.len(),
                found: checkpoint.dataset_len,
            });
        }
        Ok(checkpoint.entries.into_iter().collect())
    }

    fn save(&self, dataset: &Dataset, done: &BTreeMap<usize, RunEntry>) -> Result<(), RunnerError> {
        let Some(policy) = &self.checkpoint else {
            return Ok(());
        };
        Checkpoint {
            config_hash: policy.config_hash.clone(),
            dataset_len: dataset.len(),
            entries: done.iter().map(|(i, e)| (*i, e.clone())).collect(),
        }
        .save(&policy.path)
    }

    pub fn run(&self, dataset: &Dataset) -> Result<RunReport, RunnerError> {
        let mut done = self.restore(dataset)?;
        let resumed = done.len();
        let stats = RunnerStats::default();
        for entry in done.values() {
            stats.record(entry);
        }

        let pending: Vec<usize> = (0..dataset.len()).filter(|i| !done.contains_key(i)).collect();
        let workers = self.threads.min(pending.len()).max(1);
        info!(
            examples = dataset.len(),
            pending = pending.len(),
            resumed,
            workers,
            attack = %self.attack.describe(),
            "starting attack run"
        );

        let mut interrupted = BTreeMap::new();
        let cursor = AtomicUsize::new(0);
        let interval = self.checkpoint.as_ref().map_or(usize::MAX, |c| c.interval.max(1));
        std::thread::scope(|scope| -> Result<(), RunnerError> {
            let (tx, rx) = mpsc::channel::<(usize, RunEntry)>();
            for _ in 0..workers {
                let tx = tx.clone();
                let (cursor, pending, stats) = (&cursor, &pending, &stats);
                scope.spawn(move || {
                    while !self.cancel.is_cancelled() {
                        let slot = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(&index) = pending.get(slot) else {
                            break;
                        };
                        let Some(input) = dataset.get(index) else {
                            break;
                        };
                        let entry = match self.attack.run_with_cancel(self.classifier, input, &self.cancel) {
                            Ok(result) => RunEntry::Completed(result),
                            Err(e) => {
                                warn!(index, error = %e, "attack aborted");
                                RunEntry::Errored {
                                    input_hash: input.fingerprint(),
                                    message: e.to_string(),
                                }
                            }
                        };
                        if !entry.is_interrupted() {
                            stats.record(&entry);
                        }
                        if tx.send((index, entry)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let mut since_save = 0;
            for (index, entry) in rx {
                if entry.is_interrupted() {
                    interrupted.insert(index, entry);
                    continue;
                }
                done.insert(index, entry);
                since_save += 1;
                if since_save >= interval {
                    self.save(dataset, &done)?;
                    since_save = 0;
                }
            }
            Ok(())
        })?;
        self.save(dataset, &done)?;

        let stats = stats.snapshot();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            maxed_out = stats.maxed_out,
            errored = stats.errored,
            queries = stats.queries,
            interrupted = interrupted.len(),
            "attack run finished"
        );
        let interrupted_count = interrupted.len();
        done.extend(interrupted);
        Ok(RunReport {
            entries: done.into_iter().collect(),
            stats,
            resumed,
            interrupted: interrupted_count,
        })
    }
}
