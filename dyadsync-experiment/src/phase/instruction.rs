use super::timed::{hold_until, schedule_successor_arming};
use super::{Phase, Templated, fill, seconds, seconds_problem};
use crate::error::Result;
use crate::resources::{Content, Prompt};
use crate::runtime::Runtime;
use dyadsync_core::{InstructionResult, Participant, PhaseOutcome, TrialData, template_variables};
use dyadsync_timing::{diff_ms, to_nanos};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

fn yes() -> bool {
    true
}

fn default_font_size() -> u32 {
    24
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionParams {
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "yes")]
    pub wait_for_key: bool,
    /// Accept only this key (case-insensitive). Any key when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_key: Option<String>,
    /// Seconds before moving on by itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Templated<f64>>,
}

impl InstructionParams {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_size: default_font_size(),
            wait_for_key: true,
            continue_key: None,
            duration: None,
        }
    }

    pub(super) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.text.trim().is_empty() {
            errors.push("Instruction text cannot be empty".to_string());
        }
        if let Some(problem) = self
            .duration
            .as_ref()
            .and_then(Templated::value)
            .and_then(|d| seconds_problem("Duration", d))
        {
            errors.push(problem);
        }
        if !self.wait_for_key && self.duration.is_none() {
            errors.push("Instruction neither waits for a key nor has a duration".to_string());
        }
        errors
    }

    pub(super) fn variables(&self) -> BTreeSet<String> {
        let mut vars: BTreeSet<String> = template_variables(&self.text).into_iter().collect();
        if let Some(d) = &self.duration {
            vars.extend(d.variables());
        }
        vars
    }

    pub(super) fn render(&self, phase: &str, data: &TrialData) -> Result<Self> {
        Ok(Self {
            text: fill(phase, &self.text, data)?,
            duration: self
                .duration
                .as_ref()
                .map(|d| d.render_seconds(phase, data))
                .transpose()?,
            ..self.clone()
        })
    }

    fn display_text(&self) -> String {
        if !self.wait_for_key {
            return self.text.clone();
        }
        match &self.continue_key {
            Some(key) => format!("{}\n\nPress {} to continue", self.text, key.to_uppercase()),
            None => format!("{}\n\nPress any key to continue", self.text),
        }
    }
}

pub(super) fn run(
    phase: &Phase,
    params: &InstructionParams,
    rt: &mut Runtime,
    data: &TrialData,
) -> Result<PhaseOutcome> {
    let duration = params
        .duration
        .as_ref()
        .map(|d| d.get(&phase.name))
        .transpose()?;

    let text = params.display_text();
    for who in Participant::BOTH {
        rt.surfaces.show(
            who,
            Content::Text {
                text: text.clone(),
                font_size: params.font_size,
            },
        );
    }
    phase.emit(rt, "phase_start", None, data, None);

    let start = rt.now();
    let deadline = duration
        .map(|d| seconds(&phase.name, d).map(|d| start.saturating_add(to_nanos(d))))
        .transpose()?;

    let key = match (params.wait_for_key, deadline) {
        (true, deadline) => {
            let prompt = match &params.continue_key {
                Some(k) => Prompt::Key(k.clone()),
                None => Prompt::AnyKey,
            };
            rt.wait_for_key(&prompt, deadline)?.map(|press| press.key)
        }
        (false, Some(end)) => {
            let arming = schedule_successor_arming(phase, rt, end);
            let held = hold_until(rt, end);
            if let Some(handle) = arming {
                rt.clock.cancel(handle);
            }
            held?;
            None
        }
        (false, None) => None,
    };

    phase.emit(rt, "phase_end", None, data, None);
    Ok(PhaseOutcome::Instruction(InstructionResult {
        key,
        duration: diff_ms(rt.now(), start) / 1000.0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_names_the_continue_key() {
        let mut p = InstructionParams::new("Welcome");
        assert_eq!(p.display_text(), "Welcome\n\nPress any key to continue");
        p.continue_key = Some("space".into());
        assert_eq!(p.display_text(), "Welcome\n\nPress SPACE to continue");
        p.wait_for_key = false;
        assert_eq!(p.display_text(), "Welcome");
    }

    #[test]
    fn must_wait_or_time_out() {
        let mut p = InstructionParams::new("Relax");
        p.wait_for_key = false;
        assert_eq!(p.validate().len(), 1);
        p.duration = Some(Templated::Value(5.0));
        assert!(p.validate().is_empty());
        assert_eq!(InstructionParams::new("").validate().len(), 1);
    }
}
