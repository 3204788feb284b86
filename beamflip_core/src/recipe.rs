//! Recipe assembly: turns flat settings plus loaded resources into an [`Attack`].

use crate::attack::{Attack, AttackError};
use crate::constraint::{
    Constraint, ConstraintSet, MaxWordsPerturbed, MaxWordsSwapped, PartOfSpeech,
    WordEmbeddingDistance,
};
use crate::goal::GoalKind;
use crate::resources::{EmbeddingTable, GradientSignal, PosTagger};
use crate::search::BeamSearch;
use crate::transformation::{
    EmbeddingNeighbors, GradientWordSwap, StopwordPolicy, Transformation, VocabularySource,
    WordSwap,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformationKind {
    /// Gradient-ranked swaps, exhaustive over the vocabulary without a signal.
    Gradient,
    /// Nearest neighbours in embedding space.
    #[default]
    Embedding,
    /// Every vocabulary word at every position.
    Vocabulary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecipeName {
    Hotflip,
}

/// Everything needed to assemble an attack, fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttackSettings {
    pub beam_width: usize,
    pub max_queries: Option<usize>,
    pub batch_size: usize,
    pub goal: GoalKind,
    pub transformation: TransformationKind,
    pub replace_stopwords: bool,
    /// Replacements considered per position.
    pub top_k: usize,
    pub max_swaps: Option<usize>,
    pub max_percent: Option<f64>,
    pub min_cos_sim: Option<f64>,
    pub pos_match: bool,
}

impl Default for AttackSettings {
    fn default() -> Self {
        Self {
            beam_width: 5,
            max_queries: None,
            batch_size: 32,
            goal: GoalKind::Untargeted,
            transformation: TransformationKind::Embedding,
            replace_stopwords: false,
            top_k: 20,
            max_swaps: None,
            max_percent: None,
            min_cos_sim: None,
            pos_match: false,
        }
    }
}

impl AttackSettings {
    /// HotFlip (Ebrahimi et al., 2017), word-level: gradient-ranked swaps that
    /// leave stopwords alone, at most two swaps, cosine similarity of at least
    /// 0.8, matching part of speech, untargeted, beam width 10.
    pub fn hotflip() -> Self {
        Self {
            beam_width: 10,
            transformation: TransformationKind::Gradient,
            replace_stopwords: false,
            max_swaps: Some(2),
            min_cos_sim: Some(0.8),
            pos_match: true,
            goal: GoalKind::Untargeted,
            ..Self::default()
        }
    }

    pub fn for_recipe(recipe: RecipeName) -> Self {
        match recipe {
            RecipeName::Hotflip => Self::hotflip(),
        }
    }

    pub fn validate(&self) -> Result<(), AttackError> {
        let invalid = |msg: String| Err(AttackError::Config(msg));
        if self.beam_width == 0 {
            return invalid("beam-width must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch-size must be at least 1".into());
        }
        if self.top_k == 0 {
            return invalid("top-k must be at least 1".into());
        }
        if let Some(p) = self.max_percent {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("max-percent must be within [0, 1], got {p}"));
            }
        }
        if let Some(sim) = self.min_cos_sim {
            if !(-1.0..=1.0).contains(&sim) {
                return invalid(format!("min-cos-sim must be within [-1, 1], got {sim}"));
            }
        }
        Ok(())
    }

    /// Builds the attack, failing if a configured component lacks the
    /// resource it needs or the goal does not fit the model.
    pub fn assemble(&self, resources: &AttackResources) -> Result<Attack, AttackError> {
        self.validate()?;
        if let (GoalKind::Targeted { target_class }, Some(num_classes)) =
            (self.goal, resources.num_classes)
        {
            if target_class >= num_classes {
                return Err(AttackError::Config(format!(
                    "target class set to {target_class} with {num_classes} classes"
                )));
            }
        }

        let transformation = self.build_transformation(resources)?;
        let constraints = self.build_constraints(resources)?;
        let beam_width = NonZeroUsize::new(self.beam_width)
            .ok_or_else(|| AttackError::Config("beam-width must be at least 1".into()))?;

        Ok(Attack::new(
            transformation,
            constraints,
            self.goal,
            Box::new(BeamSearch::new(beam_width)),
        )
        .with_query_budget(self.max_queries)
        .with_batch_size(self.batch_size))
    }

    fn build_transformation(
        &self,
        resources: &AttackResources,
    ) -> Result<Box<dyn Transformation>, AttackError> {
        let stopwords = match &resources.stopwords {
            Some(set) => StopwordPolicy::new(self.replace_stopwords).with_stopwords(set.clone()),
            None => StopwordPolicy::new(self.replace_stopwords),
        };
        match self.transformation {
            TransformationKind::Gradient => {
                if resources.gradient.is_none() && resources.vocabulary.is_empty() {
                    return Err(AttackError::Config(
                        "gradient transformation needs a gradient signal or a vocabulary".into(),
                    ));
                }
                Ok(Box::new(GradientWordSwap::new(
                    resources.gradient.clone(),
                    resources.vocabulary.clone(),
                    self.top_k,
                    stopwords,
                )
                .with_goal(self.goal)))
            }
            TransformationKind::Embedding => {
                let table = resources.embeddings.clone().ok_or_else(|| {
                    AttackError::Config("embedding transformation needs embeddings".into())
                })?;
                Ok(Box::new(WordSwap::new(
                    Box::new(EmbeddingNeighbors::new(table, self.top_k)),
                    stopwords,
                )))
            }
            TransformationKind::Vocabulary => {
                if resources.vocabulary.is_empty() {
                    return Err(AttackError::Config(
                        "vocabulary transformation needs a non-empty vocabulary".into(),
                    ));
                }
                Ok(Box::new(WordSwap::new(
                    Box::new(VocabularySource::new(resources.vocabulary.clone())),
                    stopwords,
                )))
            }
        }
    }

    fn build_constraints(&self, resources: &AttackResources) -> Result<ConstraintSet, AttackError> {
        let mut constraints: Vec<Box<dyn Constraint>> = Vec::new();
        if let Some(max_swaps) = self.max_swaps {
            constraints.push(Box::new(MaxWordsSwapped { max_swaps }));
        }
        if let Some(max_fraction) = self.max_percent {
            constraints.push(Box::new(MaxWordsPerturbed { max_fraction }));
        }
        if let Some(min_cos_sim) = self.min_cos_sim {
            let table = resources.embeddings.clone().ok_or_else(|| {
                AttackError::Config("min-cos-sim constraint needs embeddings".into())
            })?;
            constraints.push(Box::new(WordEmbeddingDistance::new(table, min_cos_sim)));
        }
        if self.pos_match {
            let tagger = resources.tagger.clone().ok_or_else(|| {
                AttackError::Config("pos-match constraint needs a part-of-speech lexicon".into())
            })?;
            constraints.push(Box::new(PartOfSpeech::new(tagger)));
        }
        Ok(ConstraintSet::new(constraints))
    }
}

/// Shared, read-only resources an attack may draw on.
#[derive(Clone, Default)]
pub struct AttackResources {
    pub embeddings: Option<Arc<dyn EmbeddingTable>>,
    pub tagger: Option<Arc<dyn PosTagger>>,
    pub gradient: Option<Arc<dyn GradientSignal>>,
    pub vocabulary: Vec<String>,
    /// Overrides the default English stopword list.
    pub stopwords: Option<HashSet<String>>,
    pub num_classes: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::AttackStatus;
    use crate::input::AttackInput;
    use crate::model::BagOfWordsClassifier;
    use crate::resources::{InMemoryEmbeddings, LexiconTagger};
    use std::collections::BTreeMap;

    fn model() -> Arc<BagOfWordsClassifier> {
        let weights = BTreeMap::from([
            ("great".to_string(), vec![-2.0, 2.0]),
            ("terrible".to_string(), vec![3.0, -3.0]),
            ("banana".to_string(), vec![4.0, -4.0]),
            ("movie".to_string(), vec![0.0, 0.0]),
        ]);
        Arc::new(
            BagOfWordsClassifier::new(vec!["neg".into(), "pos".into()], vec![0.0, 0.0], weights)
                .unwrap(),
        )
    }

    fn full_resources() -> AttackResources {
        let model = model();
        let mut embeddings = InMemoryEmbeddings::new();
        embeddings.insert("great", vec![1.0, 0.0]).unwrap();
        embeddings.insert("terrible", vec![0.85, 0.5268]).unwrap();
        embeddings.insert("banana", vec![0.0, 1.0]).unwrap();
        let mut tagger = LexiconTagger::new();
        tagger.insert("great", "ADJ");
        tagger.insert("terrible", "ADJ");
        tagger.insert("banana", "NOUN");
        AttackResources {
            embeddings: Some(Arc::new(embeddings)),
            tagger: Some(Arc::new(tagger)),
            vocabulary: model.vocabulary(),
            num_classes: Some(2),
            gradient: Some(model),
            stopwords: None,
        }
    }

    #[test]
    fn hotflip_preset_matches_published_configuration() {
        let settings = AttackSettings::hotflip();
        assert_eq!(settings.beam_width, 10);
        assert_eq!(settings.max_swaps, Some(2));
        assert_eq!(settings.min_cos_sim, Some(0.8));
        assert!(settings.pos_match);
        assert!(!settings.replace_stopwords);
        assert_eq!(settings.transformation, TransformationKind::Gradient);
        assert_eq!(settings.goal, GoalKind::Untargeted);
        assert_eq!(AttackSettings::for_recipe(RecipeName::Hotflip), settings);
    }

    #[test]
    fn hotflip_attack_flips_with_gradient_swap() {
        let resources = full_resources();
        let attack = AttackSettings::hotflip().assemble(&resources).unwrap();
        assert_eq!(
            attack.describe(),
            "BeamSearch + GradientWordSwap + [MaxWordsSwapped, WordEmbeddingDistance, PartOfSpeech] + Untargeted"
        );
        let classifier = model();
        let input = AttackInput::from_text("the movie was great", 1);
        let result = attack.run(classifier.as_ref(), &input).unwrap();
        assert_eq!(result.status, AttackStatus::Succeeded);
        assert_eq!(
            result.perturbed_text().as_deref(),
            Some("the movie was terrible"),
            "banana ranks higher by gradient but fails the similarity and POS checks"
        );
    }

    #[test]
    fn targeted_gradient_attack_reaches_the_target_class() {
        let weights = BTreeMap::from([
            ("start".to_string(), vec![1.0, 0.0, 0.0]),
            ("away".to_string(), vec![0.0, 3.0, 0.0]),
            ("toward".to_string(), vec![0.0, 0.0, 2.0]),
        ]);
        let model = Arc::new(
            BagOfWordsClassifier::new(vec!["a".into(), "b".into(), "c".into()], vec![0.0; 3], weights)
                .unwrap(),
        );
        let resources = AttackResources {
            vocabulary: model.vocabulary(),
            num_classes: Some(3),
            gradient: Some(model.clone()),
            ..AttackResources::default()
        };
        let settings = AttackSettings {
            transformation: TransformationKind::Gradient,
            top_k: 1,
            goal: GoalKind::Targeted { target_class: 2 },
            ..AttackSettings::default()
        };
        let attack = settings.assemble(&resources).unwrap();
        let result = attack
            .run(model.as_ref(), &AttackInput::from_text("start", 0))
            .unwrap();
        assert_eq!(result.status, AttackStatus::Succeeded);
        assert_eq!(result.perturbed_text().as_deref(), Some("toward"));
    }

    #[test]
    fn missing_resources_are_configuration_errors() {
        let bare = AttackResources::default();
        for settings in [
            AttackSettings::hotflip(),
            AttackSettings {
                transformation: TransformationKind::Vocabulary,
                ..AttackSettings::default()
            },
            AttackSettings::default(),
            AttackSettings {
                transformation: TransformationKind::Vocabulary,
                pos_match: true,
                ..AttackSettings::default()
            },
        ] {
            let resources = AttackResources {
                vocabulary: if settings.pos_match { vec!["x".into()] } else { Vec::new() },
                ..bare.clone()
            };
            assert!(
                matches!(settings.assemble(&resources), Err(AttackError::Config(_))),
                "{settings:?} should not assemble without resources"
            );
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let resources = full_resources();
        let cases = [
            AttackSettings {
                beam_width: 0,
                ..AttackSettings::hotflip()
            },
            AttackSettings {
                top_k: 0,
                ..AttackSettings::hotflip()
            },
            AttackSettings {
                max_percent: Some(1.5),
                ..AttackSettings::hotflip()
            },
            AttackSettings {
                goal: GoalKind::Targeted { target_class: 2 },
                ..AttackSettings::hotflip()
            },
        ];
        for settings in cases {
            assert!(
                matches!(settings.assemble(&resources), Err(AttackError::Config(_))),
                "{settings:?} should be rejected"
            );
        }
    }
}
