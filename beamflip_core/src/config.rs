use crate::goal::GoalKind;
use crate::recipe::{AttackResources, AttackSettings, RecipeName, TransformationKind};
use crate::resources::{
    EmbeddingTable, InMemoryEmbeddings, LexiconTagger, PosTagger, ResourceError, load_word_list,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    pub beam_width: Option<usize>,
    pub max_queries: Option<usize>,
    pub batch_size: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GoalSettings {
    pub kind: Option<GoalKind>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransformationSettings {
    pub kind: Option<TransformationKind>,
    pub replace_stopwords: Option<bool>,
    pub top_k: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ConstraintSettings {
    pub max_swaps: Option<usize>,
    pub max_percent: Option<f64>,
    pub min_cos_sim: Option<f64>,
    pub pos_match: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ResourceSettings {
    pub model: Option<PathBuf>,
    pub embeddings: Option<PathBuf>,
    pub pos_lexicon: Option<PathBuf>,
    pub stopwords: Option<PathBuf>,
}

impl ResourceSettings {
    /// Loads the embedding table, lexicon and stopword list that are
    /// configured. The model is loaded by the caller, which owns the oracle.
    pub fn load(&self) -> Result<AttackResources, ResourceError> {
        let mut resources = AttackResources::default();
        if let Some(path) = &self.embeddings {
            let table: Arc<dyn EmbeddingTable> = Arc::new(InMemoryEmbeddings::load_from_file(path)?);
            resources.embeddings = Some(table);
        }
        if let Some(path) = &self.pos_lexicon {
            let tagger: Arc<dyn PosTagger> = Arc::new(LexiconTagger::load_from_file(path)?);
            resources.tagger = Some(tagger);
        }
        if let Some(path) = &self.stopwords {
            resources.stopwords = Some(load_word_list(path)?);
        }
        Ok(resources)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [
            &mut self.model,
            &mut self.embeddings,
            &mut self.pos_lexicon,
            &mut self.stopwords,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub num_examples: Option<usize>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub checkpoint: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
}

pub fn default_threads() -> usize {
    1
}

pub fn default_checkpoint_interval() -> usize {
    10
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            num_examples: None,
            shuffle: false,
            seed: 0,
            checkpoint: None,
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// Top-level attack configuration file.
///
/// `recipe` selects a preset; any value set in the other sections overrides
/// the preset (or the generic defaults when no recipe is named).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AttackConfig {
    #[serde(default)]
    pub recipe: Option<RecipeName>,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub goal: GoalSettings,
    #[serde(default)]
    pub transformation: TransformationSettings,
    #[serde(default)]
    pub constraints: ConstraintSettings,
    #[serde(default)]
    pub resources: ResourceSettings,
    #[serde(default)]
    pub runner: RunnerSettings,
}

impl AttackConfig {
    /// Relative resource paths are resolved against the config file's directory.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let mut config = Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        if let Some(base) = path.parent() {
            config.resources.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Recipe (or default) settings with this file's overrides applied.
    pub fn settings(&self) -> AttackSettings {
        let mut s = self
            .recipe
            .map(AttackSettings::for_recipe)
            .unwrap_or_default();

        let search = &self.search;
        s.beam_width = search.beam_width.unwrap_or(s.beam_width);
        s.max_queries = search.max_queries.or(s.max_queries);
        s.batch_size = search.batch_size.unwrap_or(s.batch_size);

        s.goal = self.goal.kind.unwrap_or(s.goal);

        let t = &self.transformation;
        s.transformation = t.kind.unwrap_or(s.transformation);
        s.replace_stopwords = t.replace_stopwords.unwrap_or(s.replace_stopwords);
        s.top_k = t.top_k.unwrap_or(s.top_k);

        let c = &self.constraints;
        s.max_swaps = c.max_swaps.or(s.max_swaps);
        s.max_percent = c.max_percent.or(s.max_percent);
        s.min_cos_sim = c.min_cos_sim.or(s.min_cos_sim);
        s.pos_match = c.pos_match.unwrap_or(s.pos_match);
        s
    }

    /// MD5 over everything that affects per-example results: the effective
    /// settings, the resources and the dataset selection. Thread count and
    /// checkpoint placement are left out so a run can resume with different ones.
    pub fn fingerprint(&self) -> String {
        let runner = &self.runner;
        let canonical = serde_json::to_vec(&(
            self.settings(),
            &self.resources,
            runner.num_examples,
            runner.shuffle,
            runner.seed,
        ))
        .unwrap_or_default();
        format!("{:x}", md5::compute(canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AttackConfig::from_toml("").unwrap();
        assert_eq!(config, AttackConfig::default());
        assert_eq!(config.settings(), AttackSettings::default());
        assert_eq!(config.runner.threads, 1);
        assert_eq!(config.runner.checkpoint_interval, 10);
    }

    #[test]
    fn recipe_values_are_overridden_by_sections() {
        let config = AttackConfig::from_toml(
            r#"
            recipe = "hotflip"

            [search]
            beam-width = 3
            max-queries = 500

            [goal]
            kind = { targeted = { target-class = 0 } }

            [constraints]
            max-swaps = 1
            max-percent = 0.5

            [runner]
            threads = 4
            shuffle = true
            seed = 7
            "#,
        )
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.beam_width, 3);
        assert_eq!(settings.max_queries, Some(500));
        assert_eq!(settings.goal, GoalKind::Targeted { target_class: 0 });
        assert_eq!(settings.max_swaps, Some(1));
        assert_eq!(settings.max_percent, Some(0.5));
        assert_eq!(settings.min_cos_sim, Some(0.8), "kept from the recipe");
        assert!(settings.pos_match, "kept from the recipe");
        assert_eq!(settings.transformation, TransformationKind::Gradient);
        assert_eq!(config.runner.threads, 4);
        assert!(config.runner.shuffle);
        assert_eq!(config.runner.seed, 7);
    }

    #[test]
    fn untargeted_goal_parses_from_plain_string() {
        let config = AttackConfig::from_toml("[goal]\nkind = \"untargeted\"\n").unwrap();
        assert_eq!(config.goal.kind, Some(GoalKind::Untargeted));
        let config = AttackConfig::from_toml("[transformation]\nkind = \"vocabulary\"\n").unwrap();
        assert_eq!(config.settings().transformation, TransformationKind::Vocabulary);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(AttackConfig::from_toml("[search]\nbeam-size = 3\n").is_err());
        assert!(AttackConfig::from_toml("recipe = \"textfooler\"\n").is_err());
    }

    #[test]
    fn load_from_file_resolves_resource_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attack.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[resources]\nmodel = \"model.json\"\nembeddings = \"/abs/vectors.txt\""
        )
        .unwrap();

        let config = AttackConfig::load_from_file(&path).unwrap();
        assert_eq!(config.resources.model, Some(dir.path().join("model.json")));
        assert_eq!(
            config.resources.embeddings,
            Some(PathBuf::from("/abs/vectors.txt"))
        );
        assert!(AttackConfig::load_from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn resource_settings_load_configured_files() {
        let dir = tempfile::tempdir().unwrap();
        let vectors = dir.path().join("vectors.txt");
        std::fs::write(&vectors, "great 1 0\nterrible 0.85 0.5268\n").unwrap();
        let lexicon = dir.path().join("lexicon.tsv");
        std::fs::write(&lexicon, "great\tADJ\n").unwrap();

        let settings = ResourceSettings {
            embeddings: Some(vectors),
            pos_lexicon: Some(lexicon),
            ..ResourceSettings::default()
        };
        let resources = settings.load().unwrap();
        assert!(resources.embeddings.is_some());
        assert!(resources.tagger.is_some());
        assert!(resources.stopwords.is_none());

        let broken = ResourceSettings {
            pos_lexicon: Some(dir.path().join("nope.tsv")),
            ..ResourceSettings::default()
        };
        assert!(matches!(broken.load(), Err(ResourceError::Io { .. })));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = AttackConfig::default();
        let mut b = AttackConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.runner.threads = 8;
        b.runner.checkpoint_interval = 1;
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.search.beam_width = Some(2);
        assert_ne!(a.fingerprint(), b.fingerprint());
        let mut c = AttackConfig::default();
        c.runner.seed = 7;
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
