//! A named phase sequence, run once per trial.

use crate::collector::{ResponseRecord, ResultCollector};
use crate::duration::DurationTotal;
use crate::error::{EngineError, Result};
use crate::phase::Phase;
use crate::preloader::ContinuousPreloader;
use crate::resources::DurationProbe;
use crate::runtime::Runtime;
use dyadsync_core::{
    FieldValue, Participant, PhaseOutcome, PhaseResults, TRIAL_ID, TRIAL_INDEX, TrialData,
    trial_index,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

impl Procedure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn add_phase(&mut self, phase: Phase) {
        self.phases.push(phase);
    }

    /// Insert at `index`, clamped to the end.
    pub fn insert_phase(&mut self, index: usize, phase: Phase) {
        let index = index.min(self.phases.len());
        self.phases.insert(index, phase);
    }

    pub fn remove_phase(&mut self, index: usize) -> Option<Phase> {
        (index < self.phases.len()).then(|| self.phases.remove(index))
    }

    /// Move the phase at `from` so it ends up at `to`. False if either index is out of range.
    pub fn move_phase(&mut self, from: usize, to: usize) -> bool {
        if from >= self.phases.len() || to >= self.phases.len() {
            return false;
        }
        let phase = self.phases.remove(from);
        self.phases.insert(to, phase);
        true
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.phases.is_empty() {
            errors.push(format!("Procedure '{}' has no phases", self.name));
        }
        for (i, phase) in self.phases.iter().enumerate() {
            errors.extend(
                phase
                    .validate()
                    .into_iter()
                    .map(|e| format!("Phase {i} ({}): {e}", phase.name)),
            );
        }
        errors
    }

    /// Trial columns referenced by any phase or marker binding.
    pub fn required_variables(&self) -> BTreeSet<String> {
        self.phases
            .iter()
            .flat_map(Phase::required_variables)
            .collect()
    }

    pub fn duration(&self, probe: Option<&dyn DurationProbe>) -> DurationTotal {
        let mut total = DurationTotal::default();
        for phase in &self.phases {
            total.add(&phase.duration_estimate(), probe);
        }
        total
    }

    /// Run every phase against `data`.
    ///
    /// Each phase is rendered into a fresh instance linked to its successor. With a
    /// preloader the next phase's STAGE 1 is queued `preload_delay` into the current
    /// phase and awaited at the boundary. Rating responses are forwarded to
    /// `collector` once all phases have run.
    pub fn execute(
        &self,
        rt: &mut Runtime,
        data: &TrialData,
        collector: Option<&mut (dyn ResultCollector + '_)>,
        preloader: Option<&ContinuousPreloader>,
    ) -> Result<PhaseResults> {
        let index = trial_index(data).ok_or(EngineError::MissingTrialIndex)?;
        info!("procedure {} starting trial {index}", self.name);

        let phases = self
            .phases
            .iter()
            .map(|p| p.render(data).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        for (current, next) in phases.iter().zip(phases.iter().skip(1)) {
            current.set_next(Some(next));
        }

        let outcome = run_phases(rt, &phases, data, preloader);
        for phase in &phases {
            phase.reset();
        }
        let results = outcome?;

        if let Some(collector) = collector {
            let sent = forward_responses(&results, data, collector)?;
            if sent > 0 {
                info!("forwarded {sent} responses for trial {index}");
            }
        }
        Ok(results)
    }
}

fn run_phases(
    rt: &mut Runtime,
    phases: &[Arc<Phase>],
    data: &TrialData,
    preloader: Option<&ContinuousPreloader>,
) -> Result<PhaseResults> {
    let mut results = PhaseResults::new();
    for (i, phase) in phases.iter().enumerate() {
        rt.check_abort()?;
        // Armed before the successor is queued, so the preloader never supersedes it.
        ensure_ready(rt, phase, i == 0)?;
        if let (Some(preloader), Some(next)) = (preloader, phases.get(i + 1)) {
            let not_before = rt.deadline_after(rt.config.preload_delay());
            preloader.preload_next(next, Some(not_before));
        }

        let outcome = phase.execute(rt, data)?;
        if results.insert(phase.name.clone(), outcome).is_some() {
            warn!("duplicate phase name {}, earlier result replaced", phase.name);
        }

        if let Some(preloader) = preloader {
            if !preloader.wait_for_preload(rt.config.preload_wait_timeout()) {
                warn!("continuing without a finished preload after {}", phase.name);
            }
        }
    }
    Ok(results)
}

/// Synchronous STAGE 1/STAGE 2 for a preloading phase nobody prepared in time.
fn ensure_ready(rt: &Runtime, phase: &Phase, first: bool) -> Result<()> {
    if !phase.needs_preload() {
        return Ok(());
    }
    if !phase.is_loaded() {
        if first {
            info!("{}: loading before first phase", phase.name);
        } else {
            warn!("{}: not preloaded, loading synchronously", phase.name);
        }
        phase.prepare(&rt.resources)?;
    }
    if !phase.is_armed() {
        if !first {
            warn!("{}: STAGE 2 missed its window, arming now", phase.name);
        }
        phase.prepare_sync(&rt.engine, rt.config.sync_lead_ms as f64)?;
    }
    Ok(())
}

/// Send each recorded rating to `collector`. Returns how many were sent.
fn forward_responses(
    results: &PhaseResults,
    data: &TrialData,
    collector: &mut dyn ResultCollector,
) -> Result<usize> {
    let trial_id = data
        .get(TRIAL_ID)
        .and_then(FieldValue::as_i64)
        .or_else(|| trial_index(data))
        .unwrap_or_default();
    let context: TrialData = data
        .iter()
        .filter(|(k, _)| k.as_str() != TRIAL_ID && k.as_str() != TRIAL_INDEX)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut sent = 0;
    for rating in results.values().filter_map(PhaseOutcome::as_rating) {
        for who in Participant::BOTH {
            let Some((response, rt)) = rating.response(who) else {
                continue;
            };
            collector.add_response(ResponseRecord::new(
                who,
                trial_id,
                response,
                rt,
                context.clone(),
            ))?;
            sent += 1;
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MemoryCollector;
    use crate::config::RuntimeConfig;
    use crate::resources::Resources;
    use crate::sim::{AutoResponder, SimProvider, SimSurfaces};
    use dyadsync_core::MarkerBinding;
    use dyadsync_timing::SimulatedTimer;
    use std::time::Duration;

    fn runtime(timer: &SimulatedTimer) -> Runtime {
        let provider = SimProvider::new(timer.shared()).with_default_duration(1.0);
        Runtime::new(
            RuntimeConfig::default(),
            timer.shared(),
            Resources::new(Arc::new(provider), [0, 1]),
            Box::new(SimSurfaces::new()),
            Box::new(AutoResponder::new(7, Duration::from_millis(400))),
        )
    }

    fn trial(index: i64) -> TrialData {
        let mut data = TrialData::new();
        data.insert("video1".into(), "a.mp4".into());
        data.insert("video2".into(), "b.mp4".into());
        data.insert(TRIAL_INDEX.into(), index.into());
        data
    }

    fn sample() -> Procedure {
        Procedure::new("Emotion")
            .with_phase(Phase::fixation(1.0))
            .with_phase(Phase::video("{video1}", "{video2}"))
            .with_phase(Phase::rating(1, 7))
    }

    #[test]
    fn editing_keeps_order() {
        let mut p = sample();
        p.insert_phase(0, Phase::instruction("Welcome"));
        assert_eq!(p.phases[0].name, "Instructions");
        assert!(p.move_phase(0, 3));
        assert_eq!(p.phases[3].name, "Instructions");
        assert!(!p.move_phase(0, 9));
        assert_eq!(p.remove_phase(3).map(|ph| ph.name), Some("Instructions".into()));
        assert!(p.remove_phase(3).is_none());
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn validation_names_the_phase() {
        let p = Procedure::new("Bad").with_phase(Phase::fixation(-1.0));
        assert_eq!(
            p.validate(),
            vec!["Phase 0 (Fixation): Duration must be positive, got -1".to_string()]
        );
        assert_eq!(Procedure::new("Empty").validate().len(), 1);
    }

    #[test]
    fn duration_counts_unknown_phases() {
        let total = sample().duration(None);
        assert_eq!(total.seconds, 1.0);
        assert_eq!(total.unknown, 2);
    }

    #[test]
    fn missing_trial_index_is_fatal() {
        let timer = SimulatedTimer::new();
        let mut rt = runtime(&timer);
        let mut data = trial(1);
        data.shift_remove(TRIAL_INDEX);
        assert!(matches!(
            sample().execute(&mut rt, &data, None, None),
            Err(EngineError::MissingTrialIndex)
        ));
    }

    #[test]
    fn slow_preload_is_joined_not_loaded_twice() {
        let timer = SimulatedTimer::new();
        let provider = SimProvider::new(timer.shared()).with_load_delay(Duration::from_millis(150));
        let config = RuntimeConfig {
            preload_wait_timeout_ms: 20,
            ..RuntimeConfig::default()
        };
        let mut rt = Runtime::new(
            config,
            timer.shared(),
            Resources::new(Arc::new(provider.clone()), [0, 1]),
            Box::new(SimSurfaces::new()),
            Box::new(AutoResponder::new(7, Duration::from_millis(400))),
        );
        let preloader =
            ContinuousPreloader::new(rt.resources.clone(), rt.timer.clone(), &rt.config).unwrap();
        let procedure = Procedure::new("Pair")
            .with_phase(Phase::fixation(0.3))
            .with_phase(Phase::video("a.mp4", "b.mp4").named("First clip"))
            .with_phase(Phase::video("c.mp4", "d.mp4").named("Second clip"));

        let results = procedure
            .execute(&mut rt, &trial(1), None, Some(&preloader))
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results["First clip"].as_video().is_some());
        assert_eq!(provider.channels_opened(), 4, "each clip opens its two channels once");
    }

    #[test]
    fn infinite_templated_duration_fails_the_trial() {
        let procedure: Procedure = serde_json::from_str(
            r#"{"name": "Wait", "phases": [{"type": "FixationPhase", "duration": "{wait}"}]}"#,
        )
        .unwrap();
        assert!(procedure.validate().is_empty());

        let timer = SimulatedTimer::new();
        let mut rt = runtime(&timer);
        let mut data = trial(1);
        data.insert("wait".into(), "inf".into());
        assert!(matches!(
            procedure.execute(&mut rt, &data, None, None),
            Err(EngineError::Render { .. })
        ));
    }

    #[test]
    fn runs_every_phase_and_forwards_ratings() {
        let timer = SimulatedTimer::new();
        let mut rt = runtime(&timer);
        let mut collector = MemoryCollector::new("test");
        let procedure = sample().with_phase(
            Phase::fixation(0.5)
                .named("Rest")
                .with_binding(MarkerBinding::new("phase_start", "100#", None).unwrap()),
        );

        let results = procedure
            .execute(&mut rt, &trial(3), Some(&mut collector), None)
            .unwrap();

        let names: Vec<_> = results.keys().cloned().collect();
        assert_eq!(names, ["Fixation", "Video Playback", "Rating Collection", "Rest"]);
        assert!(results["Video Playback"].as_video().is_some());

        let responses = collector.responses();
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.trial_id == 3));
        assert!(!responses[0].context.contains_key(TRIAL_INDEX));
        assert_eq!(rt.markers.log().last().map(|e| e.marker.to_string()), Some("1003".into()));
    }
}
