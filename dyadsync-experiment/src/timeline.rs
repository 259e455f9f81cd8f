//! The top-level execution unit: an ordered list of blocks plus session metadata.

use crate::block::{Block, ExecutionObserver};
use crate::collector::ResultCollector;
use crate::duration::DurationTotal;
use crate::error::{EngineError, Result};
use crate::resources::DurationProbe;
use crate::runtime::Runtime;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_baseline() -> f64 {
    240.0
}

fn default_stream_name() -> String {
    "ExpEvent_Markers".to_string()
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Control, participant 1 and participant 2 displays.
    #[serde(default)]
    pub display_indices: [usize; 3],
    #[serde(default = "default_audio")]
    pub audio_indices: [usize; 2],
    #[serde(default = "default_baseline")]
    pub baseline_duration: f64,
    #[serde(default = "default_stream_name")]
    pub marker_stream_name: String,
    #[serde(default = "yes")]
    pub markers_enabled: bool,
}

fn default_audio() -> [usize; 2] {
    [0, 1]
}

impl Default for TimelineMetadata {
    fn default() -> Self {
        Self {
            name: "Untitled Experiment".to_string(),
            description: String::new(),
            display_indices: [0, 1, 2],
            audio_indices: default_audio(),
            baseline_duration: default_baseline(),
            marker_stream_name: default_stream_name(),
            markers_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub metadata: TimelineMetadata,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Timeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: TimelineMetadata {
                name: name.into(),
                ..TimelineMetadata::default()
            },
            blocks: Vec::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_block(&mut self, index: usize) -> Option<Block> {
        (index < self.blocks.len()).then(|| self.blocks.remove(index))
    }

    pub fn move_block(&mut self, from: usize, to: usize) -> bool {
        if from >= self.blocks.len() || to >= self.blocks.len() {
            return false;
        }
        let block = self.blocks.remove(from);
        self.blocks.insert(to, block);
        true
    }

    pub fn validate(&self) -> Vec<String> {
        if self.blocks.is_empty() {
            return vec!["Timeline has no blocks".to_string()];
        }
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(i, block)| {
                block
                    .validate()
                    .into_iter()
                    .map(move |e| format!("Block {i} ({}): {e}", block.name))
            })
            .collect()
    }

    /// `validate` plus a check that every referenced video exists.
    pub fn validate_media(&self, exists: impl Fn(&Path) -> bool) -> Vec<String> {
        let mut errors = self.validate();
        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(list) = &block.trial_list {
                errors.extend(
                    list.validate_media(&exists)
                        .into_iter()
                        .map(|e| format!("Block {i} ({}): {e}", block.name)),
                );
            }
        }
        errors
    }

    pub fn total_trials(&self) -> usize {
        self.blocks.iter().map(Block::trial_count).sum()
    }

    pub fn duration(&self, probe: Option<&dyn DurationProbe>) -> DurationTotal {
        let mut total = DurationTotal::default();
        for block in &self.blocks {
            total += block.duration(probe);
        }
        total
    }

    /// Validate, then run every block in order.
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
        rt.markers.set_enabled(self.metadata.markers_enabled);
        info!(
            "timeline {}: {} blocks, {} trials",
            self.metadata.name,
            self.blocks.len(),
            self.total_trials()
        );

        for (index, block) in self.blocks.iter_mut().enumerate() {
            rt.check_abort()?;
            observer.block_started(index, block);
            block.execute(rt, collector.as_deref_mut(), observer)?;
            observer.block_completed(index, block);
        }
        info!("timeline {} complete", self.metadata.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use crate::procedure::Procedure;
    use crate::trial_list::TrialList;
    use dyadsync_core::TrialData;

    fn intro() -> Block {
        Block::simple(
            "Intro",
            Procedure::new("Welcome").with_phase(Phase::instruction("Welcome")),
        )
    }

    #[test]
    fn metadata_defaults_fill_partial_documents() {
        let t: Timeline = serde_json::from_str(r#"{"metadata": {"name": "Pilot"}}"#).unwrap();
        assert_eq!(t.metadata.baseline_duration, 240.0);
        assert_eq!(t.metadata.marker_stream_name, "ExpEvent_Markers");
        assert!(t.metadata.markers_enabled);
        assert!(t.blocks.is_empty());
    }

    #[test]
    fn validation_prefixes_block_position() {
        let empty = Block::trial_based(
            "Main",
            Procedure::new("Trial").with_phase(Phase::fixation(1.0)),
            TrialList::from_rows(Vec::<TrialData>::new()),
        );
        let t = Timeline::new("Pilot").with_block(intro()).with_block(empty);
        assert_eq!(t.validate(), vec!["Block 1 (Main): Trial list is empty".to_string()]);
        assert_eq!(Timeline::new("Empty").validate(), vec!["Timeline has no blocks".to_string()]);
    }

    #[test]
    fn blocks_can_be_reordered() {
        let mut t = Timeline::new("Pilot").with_block(intro());
        t.add_block(Block::simple("Outro", Procedure::new("Bye").with_phase(Phase::fixation(1.0))));
        assert!(t.move_block(1, 0));
        assert_eq!(t.blocks[0].name, "Outro");
        assert_eq!(t.remove_block(1).map(|b| b.name), Some("Intro".into()));
        assert_eq!(t.total_trials(), 1);
        assert_eq!(t.duration(None).seconds, 1.0);
    }
}
