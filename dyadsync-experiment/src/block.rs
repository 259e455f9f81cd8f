//! A procedure bound to a single run or to a trial list.

use crate::collector::ResultCollector;
use crate::duration::DurationTotal;
use crate::error::{EngineError, Result};
use crate::preloader::ContinuousPreloader;
use crate::procedure::Procedure;
use crate::resources::DurationProbe;
use crate::runtime::Runtime;
use crate::trial_list::{RandomizationConfig, TrialList};
use dyadsync_core::{TRIAL_ID, TRIAL_INDEX, Trial, TrialData};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Simple,
    TrialBased,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::TrialBased => "trial_based",
        })
    }
}

/// Progress callbacks for a running timeline. Every method defaults to doing nothing.
pub trait ExecutionObserver {
    fn block_started(&mut self, _index: usize, _block: &Block) {}
    fn trial_completed(&mut self, _block: &str, _position: usize, _trial: &Trial) {}
    fn block_completed(&mut self, _index: usize, _block: &Block) {}
}

impl ExecutionObserver for () {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    #[serde(rename = "block_type", default)]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<Procedure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_list: Option<TrialList>,
    #[serde(default)]
    pub randomization: RandomizationConfig,
    /// Trials finished by the most recent run, in execution order.
    #[serde(skip)]
    pub completed_trials: Vec<Trial>,
}

impl Block {
    pub fn simple(name: impl Into<String>, procedure: Procedure) -> Self {
        Self {
            name: name.into(),
            kind: BlockKind::Simple,
            procedure: Some(procedure),
            trial_list: None,
            randomization: RandomizationConfig::default(),
            completed_trials: Vec::new(),
        }
    }

    pub fn trial_based(name: impl Into<String>, procedure: Procedure, trials: TrialList) -> Self {
        Self {
            kind: BlockKind::TrialBased,
            trial_list: Some(trials),
            ..Self::simple(name, procedure)
        }
    }

    pub fn with_randomization(mut self, randomization: RandomizationConfig) -> Self {
        self.randomization = randomization;
        self
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(procedure) = &self.procedure else {
            errors.push("No procedure defined".to_string());
            return errors;
        };
        errors.extend(procedure.validate());

        match (self.kind, &self.trial_list) {
            (BlockKind::Simple, Some(_)) => {
                errors.push("Simple block cannot have a trial list".to_string());
            }
            (BlockKind::Simple, None) => {}
            (BlockKind::TrialBased, None) => {
                errors.push("Trial-based block requires trial list".to_string());
            }
            (BlockKind::TrialBased, Some(list)) => {
                let list_errors = list.validate();
                if list_errors.is_empty() {
                    let columns = list.common_columns();
                    let missing: Vec<String> = procedure
                        .required_variables()
                        .into_iter()
                        .filter(|v| v != TRIAL_INDEX && v != TRIAL_ID && !columns.contains(v))
                        .collect();
                    if !missing.is_empty() {
                        errors.push(format!(
                            "Trial list is missing required columns: {}",
                            missing.join(", ")
                        ));
                    }
                }
                errors.extend(list_errors);
            }
        }
        errors
    }

    /// Trials one run executes.
    pub fn trial_count(&self) -> usize {
        match self.kind {
            BlockKind::Simple => 1,
            BlockKind::TrialBased => self.trial_list.as_ref().map_or(0, TrialList::len),
        }
    }

    /// Expected run length. Each trial is rendered first so probed media contribute.
    pub fn duration(&self, probe: Option<&dyn DurationProbe>) -> DurationTotal {
        let Some(procedure) = &self.procedure else {
            return DurationTotal::default();
        };
        let Some(list) = self.trial_list.as_ref().filter(|_| self.kind == BlockKind::TrialBased)
        else {
            return procedure.duration(probe);
        };

        let mut total = DurationTotal::default();
        for (position, trial) in list.trials().iter().enumerate() {
            let data = run_data(trial, position);
            for phase in &procedure.phases {
                match phase.render(&data) {
                    Ok(rendered) => total.add(&rendered.duration_estimate(), probe),
                    Err(_) => total.unknown += 1,
                }
            }
        }
        total
    }

    /// Run the block. Validates first; the preloader is shut down however the run ends.
    pub fn execute(
        &mut self,
        rt: &mut Runtime,
        mut collector: Option<&mut (dyn ResultCollector + '_)>,
        observer: &mut dyn ExecutionObserver,
    ) -> Result<()> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let Some(procedure) = &self.procedure else {
            return Err(EngineError::Validation(vec!["No procedure defined".to_string()]));
        };

        let mut preloader =
            ContinuousPreloader::new(rt.resources.clone(), rt.timer.clone(), &rt.config)?;
        self.completed_trials.clear();

        let outcome = match (self.kind, &self.trial_list) {
            (BlockKind::TrialBased, Some(list)) => {
                let order = list.get_trials(&self.randomization);
                info!("block {}: {} trials ({:?})", self.name, order.len(), self.randomization.method);
                let mut outcome = Ok(());
                for (position, mut trial) in order.into_iter().enumerate() {
                    let step = rt.check_abort().and_then(|()| {
                        run_trial(
                            procedure,
                            rt,
                            &mut trial,
                            position,
                            collector.as_deref_mut(),
                            &preloader,
                        )
                    });
                    if let Err(e) = step {
                        outcome = Err(e);
                        break;
                    }
                    observer.trial_completed(&self.name, position, &trial);
                    self.completed_trials.push(trial);
                }
                outcome
            }
            _ => {
                info!("block {}: single run", self.name);
                let mut trial = Trial::new(0, TrialData::new());
                let step = run_trial(
                    procedure,
                    rt,
                    &mut trial,
                    0,
                    collector.as_deref_mut(),
                    &preloader,
                );
                if step.is_ok() {
                    observer.trial_completed(&self.name, 0, &trial);
                    self.completed_trials.push(trial);
                }
                step
            }
        };

        preloader.shutdown();
        let stats = preloader.stats();
        info!(
            "block {} finished {} trials; preloads submitted {}, cancelled {}, failed {}",
            self.name,
            self.completed_trials.len(),
            stats.submitted,
            stats.cancelled,
            stats.failed
        );
        if let Err(e) = &outcome {
            warn!("block {} stopped: {e}", self.name);
        }
        outcome
    }
}

/// Trial fields plus the 1-based run position and the row id.
fn run_data(trial: &Trial, position: usize) -> TrialData {
    let mut data = trial.fields.clone();
    data.insert(TRIAL_INDEX.to_string(), (position + 1).into());
    data.entry(TRIAL_ID.to_string())
        .or_insert_with(|| trial.id.into());
    data
}

fn run_trial(
    procedure: &Procedure,
    rt: &mut Runtime,
    trial: &mut Trial,
    position: usize,
    mut collector: Option<&mut (dyn ResultCollector + '_)>,
    preloader: &ContinuousPreloader,
) -> Result<()> {
    let data = run_data(trial, position);
    trial.mark_start();
    let results = procedure.execute(rt, &data, collector.as_deref_mut(), Some(preloader))?;
    trial.mark_end();
    trial.result = Some(results);
    if let Some(collector) = collector {
        collector.save_trial(trial)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use dyadsync_core::FieldValue;

    fn rows(n: usize) -> TrialList {
        TrialList::from_rows((0..n).map(|i| {
            let mut row = TrialData::new();
            row.insert("video1".into(), format!("a{i}.mp4").into());
            row.insert("video2".into(), format!("b{i}.mp4").into());
            row
        }))
    }

    fn procedure() -> Procedure {
        Procedure::new("Trial")
            .with_phase(Phase::fixation(2.0))
            .with_phase(Phase::video("{video1}", "{video2}"))
    }

    #[test]
    fn block_kind_and_trial_list_must_agree() {
        let mut simple = Block::simple("Intro", procedure());
        assert!(simple.validate().is_empty());
        simple.trial_list = Some(rows(2));
        assert!(simple.validate().contains(&"Simple block cannot have a trial list".to_string()));

        let mut trials = Block::trial_based("Main", procedure(), rows(0));
        assert_eq!(trials.validate(), vec!["Trial list is empty".to_string()]);
        trials.trial_list = None;
        assert_eq!(trials.validate(), vec!["Trial-based block requires trial list".to_string()]);

        let mut bare = Block::simple("Bare", procedure());
        bare.procedure = None;
        assert_eq!(bare.validate(), vec!["No procedure defined".to_string()]);
    }

    #[test]
    fn missing_template_columns_are_reported() {
        let p = procedure().with_phase(Phase::instruction("Rate the {emotion} clip"));
        let block = Block::trial_based("Main", p, rows(2));
        assert_eq!(
            block.validate(),
            vec!["Trial list is missing required columns: emotion".to_string()]
        );
    }

    #[test]
    fn run_data_numbers_from_one_and_keeps_row_ids() {
        let list = rows(3);
        let data = run_data(&list.trials()[2], 0);
        assert_eq!(data.get(TRIAL_INDEX), Some(&FieldValue::Int(1)));
        assert_eq!(data.get(TRIAL_ID), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn duration_renders_each_trial() {
        struct Fixed;
        impl DurationProbe for Fixed {
            fn probe(&self, _path: &str) -> Option<f64> {
                Some(4.0)
            }
        }
        let block = Block::trial_based("Main", procedure(), rows(3));
        assert_eq!(block.trial_count(), 3);
        let estimated = block.duration(Some(&Fixed));
        assert_eq!((estimated.seconds, estimated.unknown), (18.0, 0));
        assert_eq!(block.duration(None).unknown, 3);
    }

    #[test]
    fn serde_uses_snake_case_block_type() {
        let block = Block::trial_based("Main", procedure(), rows(1));
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["block_type"], "trial_based");
        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }
}
