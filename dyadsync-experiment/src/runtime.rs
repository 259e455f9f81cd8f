//! State owned by the execution thread while a timeline runs.

use crate::config::RuntimeConfig;
use crate::error::{EngineError, Result};
use crate::resources::{InputSource, KeyPress, Prompt, Resources, Surfaces};
use dyadsync_core::{
    MarkerBinding, MarkerCatalog, MarkerEvent, MarkerLog, MarkerSink, MarkerValue, Participant,
    TrialData, trial_index, wall_clock_secs,
};
use dyadsync_timing::{Clock, Nanos, SharedTimer, SyncEngine, SyncPolicy, to_nanos};
use log::{debug, error};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cross-thread request to stop at the next tick or trial boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Resolves marker bindings and forwards the values to the sink and the session log.
pub struct MarkerEmitter {
    sink: Option<Box<dyn MarkerSink>>,
    log: MarkerLog,
    catalog: Option<MarkerCatalog>,
    timer: SharedTimer,
    enabled: bool,
}

impl MarkerEmitter {
    pub fn new(timer: SharedTimer, session_id: impl Into<String>) -> Self {
        Self {
            sink: None,
            log: MarkerLog::new(session_id),
            catalog: None,
            timer,
            enabled: true,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn MarkerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_catalog(mut self, catalog: MarkerCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn log(&self) -> &MarkerLog {
        &self.log
    }

    pub fn catalog(&self) -> Option<&MarkerCatalog> {
        self.catalog.as_ref()
    }

    pub fn take_catalog(&mut self) -> Option<MarkerCatalog> {
        self.catalog.take()
    }

    /// Send one marker per binding matching `event_type`. Returns how many were sent.
    ///
    /// A binding whose template cannot be resolved is logged and skipped.
    pub fn emit(
        &mut self,
        phase_name: &str,
        bindings: &[MarkerBinding],
        event_type: &str,
        participant: Option<Participant>,
        data: &TrialData,
        response: Option<i64>,
    ) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut sent = 0;
        for binding in bindings.iter().filter(|b| b.matches(event_type, participant)) {
            let value = match binding.resolve(data, response) {
                Ok(v) => v,
                Err(e) => {
                    error!("{phase_name}: dropping {event_type} marker: {e}");
                    continue;
                }
            };
            self.send(value, event_type, phase_name, data, participant.or(binding.participant));
            sent += 1;
        }
        sent
    }

    fn send(
        &mut self,
        value: MarkerValue,
        event_type: &str,
        phase_name: &str,
        data: &TrialData,
        participant: Option<Participant>,
    ) {
        if let Some(sink) = self.sink.as_mut() {
            sink.push(&value);
        }
        if let Some(catalog) = &self.catalog {
            debug!("marker {value} ({}) {event_type} in {phase_name}", catalog.name_of(&value));
        } else {
            debug!("marker {value} {event_type} in {phase_name}");
        }
        self.log.record(MarkerEvent {
            timestamp: wall_clock_secs(),
            elapsed_ns: self.timer.now(),
            marker: value,
            event_type: event_type.to_string(),
            phase_name: phase_name.to_string(),
            trial_index: trial_index(data),
            participant,
        });
    }
}

impl std::fmt::Debug for MarkerEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerEmitter")
            .field("enabled", &self.enabled)
            .field("events", &self.log.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

/// Everything the execution thread drives: timer wheel, outputs, input and markers.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub timer: SharedTimer,
    pub clock: Clock,
    pub engine: SyncEngine,
    pub resources: Resources,
    pub surfaces: Box<dyn Surfaces>,
    pub input: Box<dyn InputSource>,
    pub markers: MarkerEmitter,
    abort: AbortHandle,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        timer: SharedTimer,
        resources: Resources,
        surfaces: Box<dyn Surfaces>,
        input: Box<dyn InputSource>,
    ) -> Self {
        let policy = SyncPolicy {
            max_spread_ms: config.max_sync_spread_ms,
            ..SyncPolicy::default()
        };
        Self {
            clock: Clock::new(timer.clone()),
            engine: SyncEngine::with_policy(timer.clone(), policy),
            markers: MarkerEmitter::new(timer.clone(), "session"),
            config,
            timer,
            resources,
            surfaces,
            input,
            abort: AbortHandle::default(),
        }
    }

    pub fn with_markers(mut self, markers: MarkerEmitter) -> Self {
        self.markers = markers;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(EngineError::Aborted);
        }
        Ok(())
    }

    pub fn now(&self) -> Nanos {
        self.timer.now()
    }

    /// One loop iteration: run due clock tasks and wait at most one frame, never past `deadline`.
    pub fn tick(&mut self, deadline: Option<Nanos>) -> Result<Nanos> {
        self.check_abort()?;
        let mut wait = self.config.frame_interval();
        if let Some(deadline) = deadline {
            let remaining = Duration::from_nanos(deadline.saturating_sub(self.now()));
            wait = wait.min(remaining);
        }
        self.clock.pump(wait);
        Ok(self.now())
    }

    /// Block until a key accepted by `prompt` arrives, or until `deadline`.
    pub fn wait_for_key(&mut self, prompt: &Prompt, deadline: Option<Nanos>) -> Result<Option<KeyPress>> {
        self.input.expect(prompt, self.now());
        loop {
            let now = self.tick(deadline)?;
            let presses = self.input.poll(now);
            if let Some(press) = presses.into_iter().find(|p| accepts(prompt, &p.key)) {
                return Ok(Some(press));
            }
            if deadline.is_some_and(|d| now >= d) {
                return Ok(None);
            }
        }
    }

    /// Deadline `d` after now.
    pub fn deadline_after(&self, d: Duration) -> Nanos {
        self.now().saturating_add(to_nanos(d))
    }
}

fn accepts(prompt: &Prompt, key: &str) -> bool {
    match prompt {
        Prompt::AnyKey => true,
        Prompt::Key(wanted) => wanted.eq_ignore_ascii_case(key),
        Prompt::Rating { .. } => false,
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("markers", &self.markers)
            .field("aborted", &self.abort.is_aborted())
            .finish_non_exhaustive()
    }
}
