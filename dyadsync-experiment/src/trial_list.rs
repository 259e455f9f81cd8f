//! Trial sources and the randomization pass that orders them for a block run.

use crate::constraints::Constraint;
use dyadsync_core::{FieldValue, Trial, TrialData, normalize_fields};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Retry budget for constrained shuffles.
pub const DEFAULT_MAX_ATTEMPTS: usize = 1000;

/// Trial fields that name media files.
const MEDIA_FIELDS: [&str; 2] = ["video1", "video2"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomizationMethod {
    #[default]
    None,
    Full,
    /// Shuffle within groups of the integer `block` field.
    Block,
    /// Rotate `condition` groups by participant number (the seed).
    LatinSquare,
    Constrained,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizationConfig {
    pub method: RandomizationMethod,
    pub seed: Option<u64>,
    pub constraints: Vec<Constraint>,
    pub max_attempts: usize,
}

impl Default for RandomizationConfig {
    fn default() -> Self {
        Self {
            method: RandomizationMethod::None,
            seed: None,
            constraints: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RandomizationConfig {
    pub fn new(method: RandomizationMethod, seed: Option<u64>) -> Self {
        Self {
            method,
            seed,
            ..Self::default()
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// The seeded generator for this run. Without a seed one is drawn and logged
    /// so the ordering can be reproduced afterwards.
    fn rng(&self) -> ChaCha8Rng {
        let seed = self.seed.unwrap_or_else(|| {
            let drawn = rand::rng().random::<u64>();
            info!("no randomization seed configured, using {drawn}");
            drawn
        });
        ChaCha8Rng::seed_from_u64(seed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TrialListDoc", into = "TrialListDoc")]
pub struct TrialList {
    /// Where the rows came from, informational only.
    pub source: Option<String>,
    trials: Vec<Trial>,
}

#[derive(Serialize, Deserialize)]
struct TrialListDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default)]
    rows: Vec<TrialData>,
}

impl From<TrialListDoc> for TrialList {
    fn from(doc: TrialListDoc) -> Self {
        let mut list = TrialList::from_rows(doc.rows);
        list.source = doc.source;
        list
    }
}

impl From<TrialList> for TrialListDoc {
    fn from(list: TrialList) -> Self {
        TrialListDoc {
            source: list.source,
            rows: list.trials.into_iter().map(|t| t.fields).collect(),
        }
    }
}

impl TrialList {
    /// Build from raw rows. Ids are the 0-based row positions.
    pub fn from_rows(rows: impl IntoIterator<Item = TrialData>) -> Self {
        let trials: Vec<Trial> = rows
            .into_iter()
            .enumerate()
            .map(|(id, row)| Trial::new(id, normalize_fields(row)))
            .collect();
        debug!("trial list with {} rows", trials.len());
        Self {
            source: None,
            trials,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn push(&mut self, row: TrialData) {
        let id = self.trials.len();
        self.trials.push(Trial::new(id, normalize_fields(row)));
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn trial_by_id(&self, id: usize) -> Option<&Trial> {
        self.trials.iter().find(|t| t.id == id)
    }

    /// Column names of the first row.
    pub fn columns(&self) -> Vec<String> {
        self.trials
            .first()
            .map(|t| t.fields.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Vec<String> {
        if self.trials.is_empty() {
            return vec!["Trial list is empty".to_string()];
        }
        Vec::new()
    }

    /// Report every referenced video that `exists` rejects.
    pub fn validate_media(&self, exists: impl Fn(&Path) -> bool) -> Vec<String> {
        let mut errors = Vec::new();
        for (i, trial) in self.trials.iter().enumerate() {
            for key in MEDIA_FIELDS {
                let Some(FieldValue::Text(path)) = trial.get(key) else {
                    continue;
                };
                if !path.is_empty() && !exists(Path::new(path)) {
                    errors.push(format!("Trial {i}: Video not found: {path}"));
                }
            }
        }
        errors
    }

    /// A new ordering of the trials. The list itself is never reordered.
    pub fn get_trials(&self, config: &RandomizationConfig) -> Vec<Trial> {
        let mut order: Vec<&Trial> = self.trials.iter().collect();

        match config.method {
            RandomizationMethod::None => {}
            RandomizationMethod::Full => {
                order.shuffle(&mut config.rng());
                info!("trials shuffled (seed {:?})", config.seed);
            }
            RandomizationMethod::Block => {
                let mut rng = config.rng();
                let mut groups: BTreeMap<i64, Vec<&Trial>> = BTreeMap::new();
                for trial in order {
                    let key = trial.get("block").and_then(FieldValue::as_i64).unwrap_or(0);
                    groups.entry(key).or_default().push(trial);
                }
                info!("trials shuffled within {} blocks (seed {:?})", groups.len(), config.seed);
                order = groups
                    .into_values()
                    .flat_map(|mut group| {
                        group.shuffle(&mut rng);
                        group
                    })
                    .collect();
            }
            RandomizationMethod::LatinSquare => {
                let participant = config.seed.unwrap_or(1);
                let mut groups: BTreeMap<String, Vec<&Trial>> = BTreeMap::new();
                for trial in order {
                    let key = trial
                        .get("condition")
                        .map(FieldValue::to_string)
                        .unwrap_or_else(|| "default".to_string());
                    groups.entry(key).or_default().push(trial);
                }
                let mut groups: Vec<Vec<&Trial>> = groups.into_values().collect();
                if !groups.is_empty() {
                    let rotation = (participant % groups.len() as u64) as usize;
                    groups.rotate_left(rotation);
                }
                info!(
                    "latin square over {} conditions for participant {participant}",
                    groups.len()
                );
                order = groups.into_iter().flatten().collect();
            }
            RandomizationMethod::Constrained => {
                let mut rng = config.rng();
                if config.constraints.is_empty() {
                    order.shuffle(&mut rng);
                } else {
                    let attempts = config.max_attempts.max(1);
                    let satisfied = (1..=attempts).find(|_| {
                        order.shuffle(&mut rng);
                        config.constraints.iter().all(|c| c.check(&order))
                    });
                    match satisfied {
                        Some(attempt) => info!("constraints satisfied on attempt {attempt}"),
                        None => warn!(
                            "could not satisfy constraints after {attempts} attempts, using best-effort ordering"
                        ),
                    }
                }
            }
        }

        order.into_iter().cloned().collect()
    }

    /// Columns every row provides.
    pub fn common_columns(&self) -> BTreeSet<String> {
        let mut rows = self.trials.iter();
        let Some(first) = rows.next() else {
            return BTreeSet::new();
        };
        let mut common: BTreeSet<String> = first.fields.keys().cloned().collect();
        for trial in rows {
            common.retain(|k| trial.fields.contains_key(k));
        }
        common
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[(&str, &str)]) -> TrialList {
        TrialList::from_rows(values.iter().map(|(k, v)| {
            let mut row = TrialData::new();
            row.insert((*k).to_string(), (*v).into());
            row
        }))
    }

    fn ids(trials: &[Trial]) -> Vec<usize> {
        trials.iter().map(|t| t.id).collect()
    }

    #[test]
    fn none_keeps_source_order() {
        let l = list(&[("x", "a"), ("x", "b"), ("x", "c")]);
        assert_eq!(ids(&l.get_trials(&RandomizationConfig::default())), vec![0, 1, 2]);
    }

    #[test]
    fn full_shuffle_is_seed_reproducible_and_pure() {
        let l = TrialList::from_rows((0..12).map(|i| {
            let mut row = TrialData::new();
            row.insert("n".into(), (i as i64).into());
            row
        }));
        let cfg = RandomizationConfig::new(RandomizationMethod::Full, Some(42));
        let a = ids(&l.get_trials(&cfg));
        let b = ids(&l.get_trials(&cfg));
        assert_eq!(a, b);
        assert_ne!(a, (0..12).collect::<Vec<_>>());
        assert_eq!(ids(l.trials()), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn block_method_keeps_groups_in_key_order() {
        let l = TrialList::from_rows([2, 1, 2, 1, 0].into_iter().map(|b: i64| {
            let mut row = TrialData::new();
            row.insert("block".into(), b.into());
            row
        }));
        let cfg = RandomizationConfig::new(RandomizationMethod::Block, Some(7));
        let blocks: Vec<i64> = l
            .get_trials(&cfg)
            .iter()
            .map(|t| t.get("block").and_then(FieldValue::as_i64).unwrap())
            .collect();
        assert_eq!(blocks, vec![0, 1, 1, 2, 2]);
    }

    #[test]
    fn latin_square_rotates_by_participant() {
        let l = list(&[("condition", "C"), ("condition", "A"), ("condition", "B")]);
        let order = |seed| -> Vec<String> {
            l.get_trials(&RandomizationConfig::new(RandomizationMethod::LatinSquare, Some(seed)))
                .iter()
                .map(|t| t.get("condition").unwrap().to_string())
                .collect()
        };
        assert_eq!(order(0), ["A", "B", "C"]);
        assert_eq!(order(1), ["B", "C", "A"]);
        assert_eq!(order(2), ["C", "A", "B"]);
    }

    #[test]
    fn aliases_and_media_validation() {
        let mut row = TrialData::new();
        row.insert("VideoPath1".into(), "here.mp4".into());
        row.insert("VideoPath2".into(), "missing.mp4".into());
        let l = TrialList::from_rows([row]);

        assert!(l.columns().contains(&"video1".to_string()));
        let errors = l.validate_media(|p| p == Path::new("here.mp4"));
        assert_eq!(errors, vec!["Trial 0: Video not found: missing.mp4"]);
    }

    #[test]
    fn columns_follow_the_source_row() {
        let mut row = TrialData::new();
        row.insert("video2".into(), "b.mp4".into());
        row.insert("emotion".into(), "happy".into());
        row.insert("video1".into(), "a.mp4".into());
        let l = TrialList::from_rows([row]);
        assert_eq!(l.columns(), ["video2", "emotion", "video1"]);
    }

    #[test]
    fn empty_list_is_invalid() {
        let l = TrialList::from_rows(Vec::new());
        assert_eq!(l.validate(), vec!["Trial list is empty"]);
        assert!(l.trial_by_id(0).is_none());
    }

    #[test]
    fn rows_serialize_inline() {
        let l = list(&[("emotion", "happy")]).with_source("stimuli.csv");
        let json = serde_json::to_string(&l).unwrap();
        let back: TrialList = serde_json::from_str(&json).unwrap();
        assert_eq!(back, l);
        assert_eq!(back.source.as_deref(), Some("stimuli.csv"));
    }
}
