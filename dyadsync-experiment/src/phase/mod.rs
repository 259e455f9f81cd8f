//! Phases: the building blocks of a procedure.
//!
//! Every phase shares one lifecycle:
//!
//! ```text
//! Unprepared -> ResourcesLoaded -> SyncArmed -> Executing -> Complete
//! ```
//!
//! Only video phases need the first two transitions. `prepare` (STAGE 1) loads
//! media and may run on the preload worker; `prepare_sync` (STAGE 2) arms the
//! loaded channels for a deadline and runs on the execution thread, usually
//! from a clock task scheduled by the phase before it.

mod instruction;
mod rating;
mod timed;
mod video;

pub use instruction::InstructionParams;
pub use rating::{P1_KEYS, P2_KEYS, RatingParams};
pub use timed::{BaselineParams, FixationParams};
pub use video::VideoParams;

use crate::duration::{DurationEstimate, UNKNOWN_DURATION};
use crate::error::{EngineError, Result};
use crate::resources::{PlaybackChannel, Resources};
use crate::runtime::Runtime;
use dyadsync_core::{MarkerBinding, Participant, PhaseOutcome, TrialData, template_variables};
use dyadsync_timing::{Nanos, SyncEngine};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhaseStatus {
    Unprepared,
    ResourcesLoaded,
    SyncArmed,
    Executing,
    Complete,
}

/// A literal value or a `{column}` template resolved by [`Phase::render`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Templated<T> {
    Value(T),
    Template(String),
}

impl<T> From<T> for Templated<T> {
    fn from(v: T) -> Self {
        Self::Value(v)
    }
}

impl<T: Clone + FromStr> Templated<T> {
    pub fn variables(&self) -> Vec<String> {
        match self {
            Self::Value(_) => Vec::new(),
            Self::Template(t) => template_variables(t),
        }
    }

    pub fn value(&self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v.clone()),
            Self::Template(t) => t.trim().parse().ok(),
        }
    }

    fn render(&self, phase: &str, data: &TrialData) -> Result<Self> {
        match self {
            Self::Value(v) => Ok(Self::Value(v.clone())),
            Self::Template(t) => {
                let filled = fill(phase, t, data)?;
                filled.trim().parse().map(Self::Value).map_err(|_| {
                    render_error(phase, format!("'{t}' resolved to '{filled}', not a number"))
                })
            }
        }
    }

    /// The concrete value, or an error if the template was never rendered.
    fn get(&self, phase: &str) -> Result<T> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Template(t) => t
                .trim()
                .parse()
                .map_err(|_| render_error(phase, format!("unrendered template '{t}'"))),
        }
    }
}

impl Templated<f64> {
    /// `render` for a length of time: the result must be a positive, representable number of seconds.
    fn render_seconds(&self, phase: &str, data: &TrialData) -> Result<Self> {
        let rendered = self.render(phase, data)?;
        if let Self::Value(secs) = &rendered
            && let Some(reason) = seconds_problem("Duration", *secs)
        {
            return Err(render_error(phase, reason));
        }
        Ok(rendered)
    }
}

/// Why `secs` cannot serve as a phase duration or timeout, if it cannot.
fn seconds_problem(what: &str, secs: f64) -> Option<String> {
    if secs.is_nan() || secs <= 0.0 {
        Some(format!("{what} must be positive, got {secs}"))
    } else if Duration::try_from_secs_f64(secs).is_err() {
        Some(format!("{what} is out of range, got {secs}"))
    } else {
        None
    }
}

/// Convert seconds to a `Duration` without panicking on infinite or huge values.
fn seconds(phase: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| render_error(phase, format!("{secs} s is not a usable duration")))
}

impl<T: fmt::Display> fmt::Display for Templated<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => v.fmt(f),
            Self::Template(t) => f.write_str(t),
        }
    }
}

fn render_error(phase: &str, reason: String) -> EngineError {
    EngineError::Render {
        phase: phase.to_string(),
        reason,
    }
}

/// Replace every `{name}` in `text` with the trial field of that name.
fn fill(phase: &str, text: &str, data: &TrialData) -> Result<String> {
    let mut out = text.to_string();
    let mut missing = Vec::new();
    for var in template_variables(text) {
        match data.get(&var) {
            Some(value) => out = out.replace(&format!("{{{var}}}"), &value.to_string()),
            None => missing.push(var),
        }
    }
    if !missing.is_empty() {
        return Err(render_error(phase, format!("trial data lacks {missing:?}")));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PhaseKind {
    #[serde(rename = "FixationPhase")]
    Fixation(FixationParams),
    #[serde(rename = "VideoPhase")]
    Video(VideoParams),
    #[serde(rename = "RatingPhase")]
    Rating(RatingParams),
    #[serde(rename = "InstructionPhase")]
    Instruction(InstructionParams),
    #[serde(rename = "BaselinePhase")]
    Baseline(BaselineParams),
}

impl PhaseKind {
    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Fixation(_) => "Fixation",
            Self::Video(_) => "Video Playback",
            Self::Rating(_) => "Rating Collection",
            Self::Instruction(_) => "Instructions",
            Self::Baseline(_) => "Baseline",
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Fixation(_) => "FixationPhase",
            Self::Video(_) => "VideoPhase",
            Self::Rating(_) => "RatingPhase",
            Self::Instruction(_) => "InstructionPhase",
            Self::Baseline(_) => "BaselinePhase",
        }
    }
}

type ChannelPair = [Box<dyn PlaybackChannel>; 2];

#[derive(Debug)]
struct Flags {
    status: PhaseStatus,
    sync_timestamp: Option<Nanos>,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Unprepared,
            sync_timestamp: None,
        }
    }
}

/// Cross-thread preload state. Lock order: `load`, then `flags`, then `channels`.
#[derive(Default)]
struct PreloadState {
    load: Mutex<()>,
    flags: Mutex<Flags>,
    channels: Mutex<Option<ChannelPair>>,
    next: Mutex<Option<Weak<Phase>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Serialize, Deserialize)]
#[serde(from = "PhaseDoc")]
pub struct Phase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marker_bindings: Vec<MarkerBinding>,
    #[serde(flatten)]
    pub kind: PhaseKind,
    #[serde(skip)]
    state: PreloadState,
}

#[derive(Deserialize)]
struct PhaseDoc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    marker_bindings: Vec<MarkerBinding>,
    #[serde(flatten)]
    kind: PhaseKind,
}

impl From<PhaseDoc> for Phase {
    fn from(doc: PhaseDoc) -> Self {
        let name = doc
            .name
            .unwrap_or_else(|| doc.kind.default_name().to_string());
        Phase::new(name, doc.kind).with_bindings(doc.marker_bindings)
    }
}

impl Clone for Phase {
    /// Copies the definition only; the clone starts unprepared.
    fn clone(&self) -> Self {
        Phase::new(self.name.clone(), self.kind.clone())
            .with_bindings(self.marker_bindings.clone())
    }
}

impl PartialEq for Phase {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.marker_bindings == other.marker_bindings
            && self.kind == other.kind
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bindings", &self.marker_bindings.len())
            .field("status", &self.status())
            .finish()
    }
}

impl Phase {
    pub fn new(name: impl Into<String>, kind: PhaseKind) -> Self {
        Self {
            name: name.into(),
            marker_bindings: Vec::new(),
            kind,
            state: PreloadState::default(),
        }
    }

    pub fn fixation(duration: f64) -> Self {
        Self::new("Fixation", PhaseKind::Fixation(FixationParams::new(duration)))
    }

    pub fn baseline(duration: f64) -> Self {
        Self::new("Baseline", PhaseKind::Baseline(BaselineParams::new(duration)))
    }

    pub fn video(p1: impl Into<String>, p2: impl Into<String>) -> Self {
        Self::new("Video Playback", PhaseKind::Video(VideoParams::new(p1, p2)))
    }

    pub fn rating(scale_min: i64, scale_max: i64) -> Self {
        Self::new(
            "Rating Collection",
            PhaseKind::Rating(RatingParams::scale(scale_min, scale_max)),
        )
    }

    pub fn instruction(text: impl Into<String>) -> Self {
        Self::new("Instructions", PhaseKind::Instruction(InstructionParams::new(text)))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bindings(mut self, bindings: Vec<MarkerBinding>) -> Self {
        self.marker_bindings = bindings;
        self
    }

    pub fn with_binding(mut self, binding: MarkerBinding) -> Self {
        self.marker_bindings.push(binding);
        self
    }

    /// True only for phases whose resources are loaded ahead of time.
    pub fn needs_preload(&self) -> bool {
        matches!(self.kind, PhaseKind::Video(_))
    }

    pub fn status(&self) -> PhaseStatus {
        lock(&self.state.flags).status
    }

    pub fn is_loaded(&self) -> bool {
        self.status() >= PhaseStatus::ResourcesLoaded
    }

    pub fn is_armed(&self) -> bool {
        self.status() >= PhaseStatus::SyncArmed
    }

    pub fn sync_timestamp(&self) -> Option<Nanos> {
        lock(&self.state.flags).sync_timestamp
    }

    fn advance(&self, to: PhaseStatus) {
        let mut flags = lock(&self.state.flags);
        if to > flags.status {
            flags.status = to;
        }
    }

    /// Back-reference to the phase that runs after this one.
    pub fn set_next(&self, next: Option<&Arc<Phase>>) {
        *lock(&self.state.next) = next.map(Arc::downgrade);
    }

    pub fn next_phase(&self) -> Option<Arc<Phase>> {
        lock(&self.state.next).as_ref().and_then(Weak::upgrade)
    }

    /// Drop loaded channels and return to `Unprepared` so the instance can run again.
    pub fn reset(&self) {
        let released = lock(&self.state.channels).take();
        if let Some(mut pair) = released {
            for channel in pair.iter_mut() {
                channel.stop();
            }
            debug!("{}: released preloaded channels", self.name);
        }
        *lock(&self.state.flags) = Flags::default();
    }

    /// STAGE 1. Loads both channels; idempotent and safe to call from the preload worker.
    ///
    /// Returns how long loading took, zero when nothing had to be done.
    pub fn prepare(&self, resources: &Resources) -> Result<Duration> {
        let PhaseKind::Video(params) = &self.kind else {
            return Ok(Duration::ZERO);
        };
        let _loading = lock(&self.state.load);
        if self.is_loaded() {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let [p1, p2] = params.paths(&self.name)?;
        let open = |who: Participant, path: &str| -> Result<Box<dyn PlaybackChannel>> {
            let mut channel = resources
                .provider
                .create_channel(Path::new(path), resources.output_for(who))?;
            channel.prepare()?;
            Ok(channel)
        };
        let pair = [open(Participant::P1, p1)?, open(Participant::P2, p2)?];

        *lock(&self.state.channels) = Some(pair);
        self.advance(PhaseStatus::ResourcesLoaded);
        let took = started.elapsed();
        info!(
            "{}: STAGE 1 complete in {:.1} ms",
            self.name,
            took.as_secs_f64() * 1000.0
        );
        Ok(took)
    }

    /// STAGE 2. Arms both channels for `now + lead_ms`; idempotent.
    pub fn prepare_sync(&self, engine: &SyncEngine, lead_ms: f64) -> Result<()> {
        if !self.needs_preload() {
            return Ok(());
        }
        let mut flags = lock(&self.state.flags);
        if flags.status >= PhaseStatus::SyncArmed {
            return Ok(());
        }
        if flags.status < PhaseStatus::ResourcesLoaded {
            return Err(EngineError::NotPrepared(self.name.clone()));
        }
        let mut channels = lock(&self.state.channels);
        let Some(pair) = channels.as_mut() else {
            return Err(EngineError::NotPrepared(self.name.clone()));
        };

        let at = engine.calculate_sync_timestamp(lead_ms);
        for channel in pair.iter_mut() {
            channel.arm(at);
        }
        flags.status = PhaseStatus::SyncArmed;
        flags.sync_timestamp = Some(at);
        info!("{}: STAGE 2 armed for t={at}ns ({lead_ms:.0} ms lead)", self.name);
        Ok(())
    }

    fn take_channels(&self) -> Option<ChannelPair> {
        lock(&self.state.channels).take()
    }

    /// Run the phase on the execution thread.
    ///
    /// A preloading phase must already be loaded and armed; anything else is an
    /// orchestration bug and fails without side effects.
    pub fn execute(&self, rt: &mut Runtime, data: &TrialData) -> Result<PhaseOutcome> {
        if self.needs_preload() {
            let status = self.status();
            if status < PhaseStatus::ResourcesLoaded {
                return Err(EngineError::NotPrepared(self.name.clone()));
            }
            if status < PhaseStatus::SyncArmed {
                return Err(EngineError::NotArmed(self.name.clone()));
            }
        }
        self.advance(PhaseStatus::Executing);
        info!("executing {} ({})", self.name, self.kind.type_name());

        let outcome = match &self.kind {
            PhaseKind::Fixation(p) => {
                timed::run(self, rt, data, p.duration.get(&self.name)?)
            }
            PhaseKind::Baseline(p) => {
                timed::run(self, rt, data, p.duration.get(&self.name)?)
            }
            PhaseKind::Video(p) => video::run(self, p, rt, data),
            PhaseKind::Rating(p) => rating::run(self, p, rt, data),
            PhaseKind::Instruction(p) => instruction::run(self, p, rt, data),
        };
        rt.surfaces.clear();

        if outcome.is_ok() {
            self.advance(PhaseStatus::Complete);
        }
        outcome
    }

    /// Send markers for `event_type` through the runtime's emitter.
    fn emit(
        &self,
        rt: &mut Runtime,
        event_type: &str,
        participant: Option<Participant>,
        data: &TrialData,
        response: Option<i64>,
    ) {
        rt.markers.emit(
            &self.name,
            &self.marker_bindings,
            event_type,
            participant,
            data,
            response,
        );
    }

    /// Configuration problems, empty when the phase can run.
    pub fn validate(&self) -> Vec<String> {
        match &self.kind {
            PhaseKind::Fixation(p) => timed::validate(&p.duration),
            PhaseKind::Baseline(p) => timed::validate(&p.duration),
            PhaseKind::Video(p) => p.validate(),
            PhaseKind::Rating(p) => p.validate(),
            PhaseKind::Instruction(p) => p.validate(),
        }
    }

    /// A fresh, unprepared copy with every `{column}` replaced from `data`.
    pub fn render(&self, data: &TrialData) -> Result<Phase> {
        let name = &self.name;
        let kind = match &self.kind {
            PhaseKind::Fixation(p) => PhaseKind::Fixation(FixationParams {
                duration: p.duration.render_seconds(name, data)?,
            }),
            PhaseKind::Baseline(p) => PhaseKind::Baseline(BaselineParams {
                duration: p.duration.render_seconds(name, data)?,
            }),
            PhaseKind::Video(p) => PhaseKind::Video(p.render(name, data)?),
            PhaseKind::Rating(p) => PhaseKind::Rating(p.render(name, data)?),
            PhaseKind::Instruction(p) => PhaseKind::Instruction(p.render(name, data)?),
        };
        Ok(Phase::new(name.clone(), kind).with_bindings(self.marker_bindings.clone()))
    }

    /// Trial columns this phase and its marker bindings reference.
    pub fn required_variables(&self) -> BTreeSet<String> {
        let mut vars: BTreeSet<String> = match &self.kind {
            PhaseKind::Fixation(p) => p.duration.variables().into_iter().collect(),
            PhaseKind::Baseline(p) => p.duration.variables().into_iter().collect(),
            PhaseKind::Video(p) => p.variables(),
            PhaseKind::Rating(p) => p.variables(),
            PhaseKind::Instruction(p) => p.variables(),
        };
        for binding in &self.marker_bindings {
            vars.extend(template_variables(&binding.template));
        }
        vars
    }

    pub fn duration_estimate(&self) -> DurationEstimate {
        let fixed_or_variable = |v: Option<f64>| match v {
            Some(s) => DurationEstimate::Fixed(s),
            None => DurationEstimate::Variable,
        };
        match &self.kind {
            PhaseKind::Fixation(p) => fixed_or_variable(p.duration.value()),
            PhaseKind::Baseline(p) => fixed_or_variable(p.duration.value()),
            PhaseKind::Video(p) => p.estimate(),
            PhaseKind::Rating(p) => fixed_or_variable(p.timeout),
            PhaseKind::Instruction(p) => {
                fixed_or_variable(p.duration.as_ref().and_then(Templated::value))
            }
        }
    }

    /// Seconds, or [`UNKNOWN_DURATION`] when it depends on media or the participants.
    pub fn estimated_seconds(&self) -> f64 {
        match self.duration_estimate() {
            DurationEstimate::Fixed(s) => s,
            _ => UNKNOWN_DURATION,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind.type_name(), self.name)
    }
}
