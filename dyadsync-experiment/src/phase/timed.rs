//! Fixation and baseline: a cross on both displays for a fixed time.

use super::{Phase, Templated, seconds, seconds_problem};
use crate::error::Result;
use crate::resources::Content;
use crate::runtime::Runtime;
use dyadsync_core::{Participant, PhaseOutcome, TimedResult, TrialData};
use dyadsync_timing::{Nanos, TimerHandle, diff_ms, to_nanos};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixationParams {
    /// Seconds.
    pub duration: Templated<f64>,
}

impl FixationParams {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Templated::Value(duration),
        }
    }
}

impl Default for FixationParams {
    fn default() -> Self {
        Self::new(3.0)
    }
}

/// Resting-state recording, typically a few minutes at the start of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineParams {
    /// Seconds.
    pub duration: Templated<f64>,
}

impl BaselineParams {
    pub fn new(duration: f64) -> Self {
        Self {
            duration: Templated::Value(duration),
        }
    }
}

impl Default for BaselineParams {
    fn default() -> Self {
        Self::new(240.0)
    }
}

pub(super) fn validate(duration: &Templated<f64>) -> Vec<String> {
    match (duration.value(), duration) {
        (Some(d), _) => seconds_problem("Duration", d).into_iter().collect(),
        (None, Templated::Template(t)) if duration.variables().is_empty() => {
            vec![format!("Duration '{t}' is neither a number nor a {{column}} template")]
        }
        (None, _) => Vec::new(),
    }
}

pub(super) fn run(
    phase: &Phase,
    rt: &mut Runtime,
    data: &TrialData,
    duration: f64,
) -> Result<PhaseOutcome> {
    phase.emit(rt, "phase_start", None, data, None);
    for who in Participant::BOTH {
        rt.surfaces.show(who, Content::FixationCross);
    }

    let start = rt.now();
    let end = start.saturating_add(to_nanos(seconds(&phase.name, duration)?));
    let arming = schedule_successor_arming(phase, rt, end);
    let held = hold_until(rt, end);
    if let Some(handle) = arming {
        rt.clock.cancel(handle);
    }
    held?;

    phase.emit(rt, "phase_end", None, data, None);
    Ok(PhaseOutcome::Timed(TimedResult {
        duration: diff_ms(rt.now(), start) / 1000.0,
    }))
}

/// Drive the clock until `end`, giving up early on abort.
pub(super) fn hold_until(rt: &mut Runtime, end: Nanos) -> Result<()> {
    while rt.now() < end {
        rt.tick(Some(end))?;
    }
    Ok(())
}

/// Arm the successor `sync_lead` before `end` so its channels start as this phase ends.
///
/// Returns the clock task to cancel if this phase stops early. When less than the
/// lead remains the successor is armed on the spot.
pub(super) fn schedule_successor_arming(
    phase: &Phase,
    rt: &mut Runtime,
    end: Nanos,
) -> Option<TimerHandle> {
    let next = phase.next_phase().filter(|n| n.needs_preload())?;
    let lead = rt.config.sync_lead();
    let lead_ms = lead.as_secs_f64() * 1000.0;
    let arm_at = end.saturating_sub(to_nanos(lead));
    let engine = rt.engine.clone();
    let owner = phase.name.clone();

    let arm = move || {
        if !next.is_loaded() {
            warn!(
                "{owner}: STAGE 1 for {} has not finished at STAGE 2 time",
                next.name
            );
        }
        if let Err(e) = next.prepare_sync(&engine, lead_ms) {
            warn!("{owner}: STAGE 2 for {} failed, it will be armed on entry: {e}", next.name);
        }
    };

    let now = rt.now();
    if arm_at <= now {
        warn!(
            "{}: only {:.1} ms left before the boundary, arming the next phase immediately",
            phase.name,
            diff_ms(end, now)
        );
        arm();
        return None;
    }
    info!(
        "{}: STAGE 2 for the next phase scheduled {:.1} ms from now",
        phase.name,
        diff_ms(arm_at, now)
    );
    Some(rt.clock.at(arm_at, arm))
}
