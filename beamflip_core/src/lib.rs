pub mod attack;
pub mod candidate;
pub mod config;
pub mod constraint;
pub mod dataset;
pub mod goal;
pub mod input;
pub mod model;
pub mod recipe;
pub mod resources;
pub mod runner;
pub mod search;
pub mod transformation;

pub use attack::{Attack, AttackError, AttackResult, AttackStatus};
pub use candidate::{Candidate, Edit, ScoredCandidate};
pub use config::AttackConfig;
pub use constraint::{Constraint, ConstraintSet};
pub use dataset::{Dataset, DatasetError};
pub use goal::{GoalError, GoalFunction, GoalKind};
pub use input::AttackInput;
pub use model::{BagOfWordsClassifier, Classifier, FnClassifier, ModelError};
pub use recipe::{AttackResources, AttackSettings};
pub use resources::{EmbeddingTable, GradientSignal, PosTagger, ResourceError};
pub use runner::{
    AttackRunner, Checkpoint, CheckpointPolicy, RunEntry, RunReport, RunnerError, RunnerStats,
    StatsSnapshot,
};
pub use search::{BeamSearch, CancelToken, SearchStrategy};
pub use transformation::Transformation;
