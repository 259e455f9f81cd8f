use super::{Phase, Templated, fill, seconds, seconds_problem};
use crate::error::Result;
use crate::resources::{Content, Prompt};
use crate::runtime::Runtime;
use dyadsync_core::{Participant, PhaseOutcome, RatingResult, TrialData, template_variables};
use dyadsync_timing::{diff_ms, to_nanos};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Response keys by scale position. P1 uses the digit row, P2 the letter row.
pub const P1_KEYS: [&str; 9] = ["1", "2", "3", "4", "5", "6", "7", "8", "9"];
pub const P2_KEYS: [&str; 9] = ["q", "w", "e", "r", "t", "y", "u", "i", "o"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingParams {
    pub question: String,
    pub scale_min: Templated<i64>,
    pub scale_max: Templated<i64>,
    pub scale_labels: Vec<String>,
    /// Seconds; without it the phase waits for both answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl Default for RatingParams {
    fn default() -> Self {
        Self {
            question: "How did the video make you feel?".to_string(),
            scale_min: Templated::Value(1),
            scale_max: Templated::Value(7),
            scale_labels: vec!["Awful".into(), "Neutral".into(), "Amazing".into()],
            timeout: None,
        }
    }
}

impl RatingParams {
    pub fn scale(scale_min: i64, scale_max: i64) -> Self {
        Self {
            scale_min: scale_min.into(),
            scale_max: scale_max.into(),
            ..Self::default()
        }
    }

    pub(super) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.question.trim().is_empty() {
            errors.push("Rating question cannot be empty".to_string());
        }
        if let (Some(min), Some(max)) = (self.scale_min.value(), self.scale_max.value()) {
            if min >= max {
                errors.push(format!("Scale min ({min}) must be less than max ({max})"));
            } else if max - min + 1 > P1_KEYS.len() as i64 {
                errors.push(format!(
                    "Scale {min}..{max} has more points than the {} response keys",
                    P1_KEYS.len()
                ));
            }
        }
        if let Some(problem) = self.timeout.and_then(|t| seconds_problem("Timeout", t)) {
            errors.push(problem);
        }
        errors
    }

    pub(super) fn variables(&self) -> BTreeSet<String> {
        let mut vars: BTreeSet<String> = template_variables(&self.question).into_iter().collect();
        vars.extend(self.scale_min.variables());
        vars.extend(self.scale_max.variables());
        vars
    }

    pub(super) fn render(&self, phase: &str, data: &TrialData) -> Result<Self> {
        Ok(Self {
            question: fill(phase, &self.question, data)?,
            scale_min: self.scale_min.render(phase, data)?,
            scale_max: self.scale_max.render(phase, data)?,
            scale_labels: self.scale_labels.clone(),
            timeout: self.timeout,
        })
    }
}

/// Map a key to the participant who owns it and the scale value it stands for.
pub(super) fn response_for(key: &str, scale_min: i64, scale_max: i64) -> Option<(Participant, i64)> {
    let lookup = |keys: &[&str]| keys.iter().position(|k| k.eq_ignore_ascii_case(key));
    let (who, position) = match (lookup(&P1_KEYS), lookup(&P2_KEYS)) {
        (Some(i), _) => (Participant::P1, i),
        (None, Some(i)) => (Participant::P2, i),
        (None, None) => return None,
    };
    let value = scale_min + position as i64;
    (value <= scale_max).then_some((who, value))
}

fn prompt_text(params: &RatingParams, who: Participant, min: i64, max: i64) -> String {
    let points = (max - min + 1).clamp(1, P1_KEYS.len() as i64) as usize;
    let first = params.scale_labels.first().map(String::as_str).unwrap_or_default();
    let last = params.scale_labels.last().map(String::as_str).unwrap_or_default();
    match who {
        Participant::P1 => format!(
            "{}\n\nParticipant 1: Use number keys {}-{}\n{} = {first}, {} = {last}",
            params.question,
            P1_KEYS[0],
            P1_KEYS[points - 1],
            P1_KEYS[0],
            P1_KEYS[points - 1],
        ),
        Participant::P2 => {
            let q = P2_KEYS[0].to_uppercase();
            let end = P2_KEYS[points - 1].to_uppercase();
            format!(
                "{}\n\nParticipant 2: Use keys {q}-{end}\n{q} = {first}, {end} = {last}",
                params.question
            )
        }
    }
}

pub(super) fn run(
    phase: &Phase,
    params: &RatingParams,
    rt: &mut Runtime,
    data: &TrialData,
) -> Result<PhaseOutcome> {
    let min = params.scale_min.get(&phase.name)?;
    let max = params.scale_max.get(&phase.name)?;

    for who in Participant::BOTH {
        rt.surfaces.show(
            who,
            Content::Text {
                text: prompt_text(params, who, min, max),
                font_size: 24,
            },
        );
    }
    phase.emit(rt, "phase_start", None, data, None);

    let onset = rt.now();
    let deadline = params
        .timeout
        .map(|t| seconds(&phase.name, t).map(|d| onset.saturating_add(to_nanos(d))))
        .transpose()?;
    rt.input.expect(
        &Prompt::Rating {
            scale_min: min,
            scale_max: max,
        },
        onset,
    );

    let mut result = RatingResult::default();
    while !result.is_complete() {
        let now = rt.tick(deadline)?;
        for press in rt.input.poll(now) {
            let Some((who, value)) = response_for(&press.key, min, max) else {
                continue;
            };
            if result.response(who).is_some() {
                continue;
            }
            let rt_secs = diff_ms(press.at.max(onset), onset) / 1000.0;
            result.record(who, value, rt_secs);
            info!("{}: {who} answered {value} after {rt_secs:.3} s", phase.name);

            let event = match who {
                Participant::P1 => "p1_response",
                Participant::P2 => "p2_response",
            };
            phase.emit(rt, event, Some(who), data, Some(value));
            rt.surfaces.show(
                who,
                Content::Text {
                    text: format!("Response recorded: {value}"),
                    font_size: 24,
                },
            );
        }
        if deadline.is_some_and(|d| now >= d) {
            info!("{}: timed out", phase.name);
            break;
        }
    }

    phase.emit(rt, "phase_end", None, data, None);
    Ok(PhaseOutcome::Rating(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_onto_the_scale() {
        assert_eq!(response_for("1", 1, 7), Some((Participant::P1, 1)));
        assert_eq!(response_for("7", 1, 7), Some((Participant::P1, 7)));
        assert_eq!(response_for("8", 1, 7), None);
        assert_eq!(response_for("U", 1, 7), Some((Participant::P2, 7)));
        assert_eq!(response_for("q", 0, 4), Some((Participant::P2, 0)));
        assert_eq!(response_for("space", 1, 7), None);
    }

    #[test]
    fn validation_messages() {
        let mut p = RatingParams::scale(5, 5);
        p.timeout = Some(-1.0);
        assert_eq!(
            p.validate(),
            vec![
                "Scale min (5) must be less than max (5)".to_string(),
                "Timeout must be positive, got -1".to_string(),
            ]
        );
        assert_eq!(RatingParams::scale(0, 10).validate().len(), 1);
        p = RatingParams::default();
        p.timeout = Some(1e300);
        let errors = p.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Timeout is out of range"), "{errors:?}");
        assert!(RatingParams::default().validate().is_empty());
    }

    #[test]
    fn prompts_name_each_participants_keys() {
        let p = RatingParams::default();
        assert!(prompt_text(&p, Participant::P1, 1, 7).contains("Use number keys 1-7"));
        assert!(prompt_text(&p, Participant::P2, 1, 7).contains("Use keys Q-U"));
    }
}
