use crate::error::CollectorError;
use dyadsync_core::{Participant, Trial, TrialData, wall_clock_secs};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One participant's answer to one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub participant: Participant,
    pub trial_id: i64,
    pub response: i64,
    /// Seconds from question onset.
    pub rt: Option<f64>,
    pub timestamp: f64,
    /// Stimulus fields of the trial the response belongs to.
    pub context: TrialData,
}

impl ResponseRecord {
    pub fn new(
        participant: Participant,
        trial_id: i64,
        response: i64,
        rt: Option<f64>,
        context: TrialData,
    ) -> Self {
        Self {
            participant,
            trial_id,
            response,
            rt,
            timestamp: wall_clock_secs(),
            context,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    pub experiment: String,
    pub trials: Vec<Trial>,
    pub responses: Vec<ResponseRecord>,
}

/// Persistence checkpoint invoked after every trial and rating.
pub trait ResultCollector {
    fn save_trial(&mut self, trial: &Trial) -> Result<(), CollectorError>;

    fn add_response(&mut self, record: ResponseRecord) -> Result<(), CollectorError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCollector {
    pub document: ResultDocument,
}

impl MemoryCollector {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            document: ResultDocument {
                experiment: experiment.into(),
                ..ResultDocument::default()
            },
        }
    }

    pub fn trials(&self) -> &[Trial] {
        &self.document.trials
    }

    pub fn responses(&self) -> &[ResponseRecord] {
        &self.document.responses
    }
}

impl ResultCollector for MemoryCollector {
    fn save_trial(&mut self, trial: &Trial) -> Result<(), CollectorError> {
        if trial.result.is_none() {
            warn!("trial {} has no result data, not saved", trial.id);
            return Ok(());
        }
        self.document.trials.push(trial.clone());
        Ok(())
    }

    fn add_response(&mut self, record: ResponseRecord) -> Result<(), CollectorError> {
        self.document.responses.push(record);
        Ok(())
    }
}

/// Rewrites a pretty-printed JSON file at every checkpoint so a crash loses at most one trial.
#[derive(Debug)]
pub struct JsonCollector {
    path: PathBuf,
    inner: MemoryCollector,
}

impl JsonCollector {
    pub fn create(path: impl Into<PathBuf>, experiment: impl Into<String>) -> Result<Self, CollectorError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let collector = Self {
            path,
            inner: MemoryCollector::new(experiment),
        };
        collector.flush()?;
        info!("writing results to {}", collector.path.display());
        Ok(collector)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &ResultDocument {
        &self.inner.document
    }

    fn flush(&self) -> Result<(), CollectorError> {
        let file = std::fs::File::create(&self.path)?;
        serde_json::to_writer_pretty(file, &self.inner.document)?;
        Ok(())
    }
}

impl ResultCollector for JsonCollector {
    fn save_trial(&mut self, trial: &Trial) -> Result<(), CollectorError> {
        self.inner.save_trial(trial)?;
        self.flush()
    }

    fn add_response(&mut self, record: ResponseRecord) -> Result<(), CollectorError> {
        self.inner.add_response(record)?;
        self.flush()
    }
}
