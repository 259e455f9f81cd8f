//! Marker bindings and the template grammar that turns them into concrete codes.
//!
//! - `8888` is a static integer, `baseline` a static string.
//! - `#` is replaced by the trial index: `100#` with trial 3 gives `1003`.
//! - `$` is replaced by a response value and requires `#`: `300#0$` with trial 3,
//!   response 7 gives `300307`.
//! - `{name}` is replaced by the trial field `name` and always yields a string.

use crate::trial::{FieldValue, TRIAL_INDEX, TrialData};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("invalid marker template '{template}': {reason}")]
    Syntax { template: String, reason: String },

    #[error("template '{template}' needs {missing:?} but the trial data does not provide them")]
    MissingVariables {
        template: String,
        missing: Vec<String>,
    },

    #[error("template '{template}' needs a trial index")]
    MissingTrialIndex { template: String },

    #[error("template '{template}' needs a response value")]
    MissingResponse { template: String },

    #[error("template '{template}' resolved to '{resolved}', which is not an integer")]
    NotAnInteger { template: String, resolved: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkerValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for MarkerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MarkerValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for MarkerValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Participant {
    P1,
    P2,
}

impl Participant {
    pub const BOTH: [Participant; 2] = [Participant::P1, Participant::P2];

    pub fn number(self) -> u8 {
        match self {
            Self::P1 => 1,
            Self::P2 => 2,
        }
    }
}

impl TryFrom<u8> for Participant {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::P1),
            2 => Ok(Self::P2),
            other => Err(format!("participant must be 1 or 2, got {other}")),
        }
    }
}

impl From<Participant> for u8 {
    fn from(p: Participant) -> u8 {
        p.number()
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.number())
    }
}

/// "When `event_type` happens, send the marker `template` resolves to."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBinding")]
pub struct MarkerBinding {
    pub event_type: String,
    #[serde(rename = "marker_template")]
    pub template: String,
    /// `None` fires for either participant.
    pub participant: Option<Participant>,
}

#[derive(Deserialize)]
struct RawBinding {
    event_type: String,
    marker_template: String,
    #[serde(default)]
    participant: Option<Participant>,
}

impl TryFrom<RawBinding> for MarkerBinding {
    type Error = TemplateError;

    fn try_from(raw: RawBinding) -> Result<Self, Self::Error> {
        MarkerBinding::new(raw.event_type, raw.marker_template, raw.participant)
    }
}

impl MarkerBinding {
    pub fn new(
        event_type: impl Into<String>,
        template: impl Into<String>,
        participant: Option<Participant>,
    ) -> Result<Self, TemplateError> {
        let template = template.into();
        validate_template_syntax(&template)?;
        Ok(Self {
            event_type: event_type.into(),
            template,
            participant,
        })
    }

    pub fn matches(&self, event_type: &str, participant: Option<Participant>) -> bool {
        self.event_type == event_type
            && match (self.participant, participant) {
                (None, _) | (_, None) => true,
                (Some(a), Some(b)) => a == b,
            }
    }

    pub fn resolve(
        &self,
        data: &TrialData,
        response: Option<i64>,
    ) -> Result<MarkerValue, TemplateError> {
        resolve_marker_template(&self.template, data, response)
    }
}

impl fmt::Display for MarkerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.event_type, self.template)?;
        if let Some(p) = self.participant {
            write!(f, " [{p}]")?;
        }
        Ok(())
    }
}

/// Anything that accepts resolved marker values, e.g. an outlet to the recording system.
pub trait MarkerSink: Send {
    fn push(&mut self, value: &MarkerValue);
}

impl MarkerSink for Vec<MarkerValue> {
    fn push(&mut self, value: &MarkerValue) {
        Vec::push(self, value.clone());
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_string_template(template: &str) -> bool {
    template.contains('{') && template.contains('}')
}

fn is_numeric_template(template: &str) -> bool {
    template.contains('#') || template.contains('$')
}

/// Names of every `{name}` placeholder, in order of appearance.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if !name.is_empty() && name.chars().all(is_word) {
                    out.push(name.to_string());
                    rest = &after[close + 1..];
                } else {
                    rest = after;
                }
            }
            None => break,
        }
    }
    out
}

fn syntax(template: &str, reason: &str) -> TemplateError {
    TemplateError::Syntax {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_template_syntax(template: &str) -> Result<(), TemplateError> {
    if is_string_template(template) {
        let variables = template_variables(template);
        if variables.is_empty() {
            return Err(syntax(template, "string template needs at least one {variable}"));
        }
        let mut remaining = template.to_string();
        for var in &variables {
            remaining = remaining.replace(&format!("{{{var}}}"), "");
        }
        if !remaining.chars().all(|c| is_word(c) || c == '-') {
            return Err(syntax(
                template,
                "only word characters, hyphens and {variables} are allowed",
            ));
        }
        return Ok(());
    }

    if is_numeric_template(template) {
        if !template.chars().all(|c| c.is_ascii_digit() || c == '#' || c == '$') {
            return Err(syntax(template, "only digits, '#' and '$' are allowed"));
        }
        if template.matches('#').count() > 1 {
            return Err(syntax(template, "at most one '#'"));
        }
        if template.matches('$').count() > 1 {
            return Err(syntax(template, "at most one '$'"));
        }
        if template.contains('$') && !template.contains('#') {
            return Err(syntax(template, "'$' requires a trial marker '#'"));
        }
    }

    Ok(())
}

/// Resolve `template` against trial data and an optional response value.
pub fn resolve_marker_template(
    template: &str,
    data: &TrialData,
    response: Option<i64>,
) -> Result<MarkerValue, TemplateError> {
    if is_string_template(template) {
        let variables = template_variables(template);
        let missing: Vec<String> = variables
            .iter()
            .filter(|v| !data.contains_key(v.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingVariables {
                template: template.to_string(),
                missing,
            });
        }
        let mut out = template.to_string();
        for var in &variables {
            out = out.replace(&format!("{{{var}}}"), &data[var.as_str()].to_string());
        }
        return Ok(MarkerValue::Text(out));
    }

    if is_numeric_template(template) {
        if !template.contains('#') {
            return Err(syntax(template, "'$' requires a trial marker '#'"));
        }
        let index = data
            .get(TRIAL_INDEX)
            .map(FieldValue::to_string)
            .ok_or_else(|| TemplateError::MissingTrialIndex {
                template: template.to_string(),
            })?;
        let mut out = template.replace('#', &index);
        if template.contains('$') {
            let response = response.ok_or_else(|| TemplateError::MissingResponse {
                template: template.to_string(),
            })?;
            out = out.replace('$', &response.to_string());
        }
        return out
            .parse()
            .map(MarkerValue::Int)
            .map_err(|_| TemplateError::NotAnInteger {
                template: template.to_string(),
                resolved: out,
            });
    }

    Ok(template
        .parse()
        .map(MarkerValue::Int)
        .unwrap_or_else(|_| MarkerValue::Text(template.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(index: i64) -> TrialData {
        let mut data = TrialData::new();
        data.insert(TRIAL_INDEX.into(), index.into());
        data
    }

    #[test]
    fn trial_indexed_and_response_templates() {
        assert_eq!(
            resolve_marker_template("100#", &trial(3), None).unwrap(),
            MarkerValue::Int(1003)
        );
        assert_eq!(
            resolve_marker_template("300#0$", &trial(3), Some(7)).unwrap(),
            MarkerValue::Int(300307)
        );
    }

    #[test]
    fn string_template_substitutes_fields() {
        let mut data = trial(3);
        data.insert("type".into(), "happy".into());
        assert_eq!(
            resolve_marker_template("{type}_start", &data, None).unwrap(),
            MarkerValue::from("happy_start")
        );
        assert_eq!(
            resolve_marker_template("{type}_trial_{trial_index}", &data, None).unwrap(),
            MarkerValue::from("happy_trial_3")
        );
    }

    #[test]
    fn static_markers_parse_when_they_can() {
        let empty = TrialData::new();
        assert_eq!(
            resolve_marker_template("8888", &empty, None).unwrap(),
            MarkerValue::Int(8888)
        );
        assert_eq!(
            resolve_marker_template("baseline", &empty, None).unwrap(),
            MarkerValue::from("baseline")
        );
    }

    #[test]
    fn missing_inputs_are_reported() {
        let empty = TrialData::new();
        assert!(matches!(
            resolve_marker_template("100#", &empty, None),
            Err(TemplateError::MissingTrialIndex { .. })
        ));
        assert!(matches!(
            resolve_marker_template("300#0$", &trial(1), None),
            Err(TemplateError::MissingResponse { .. })
        ));
        assert!(matches!(
            resolve_marker_template("{type}_start", &trial(1), None),
            Err(TemplateError::MissingVariables { missing, .. }) if missing == vec!["type".to_string()]
        ));
    }

    #[test]
    fn syntax_rules() {
        for ok in ["8888", "100#", "300#0$", "{type}_start", "{a}-{b}", "plain"] {
            assert!(validate_template_syntax(ok).is_ok(), "{ok}");
        }
        for bad in ["10#0#", "1$", "1$#$", "10a#", "{type} start", "{}x"] {
            assert!(validate_template_syntax(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn binding_round_trips_with_wire_names() {
        let binding = MarkerBinding::new("p1_response", "300#0$", Some(Participant::P1)).unwrap();
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["marker_template"], "300#0$");
        assert_eq!(json["participant"], 1);
        let back: MarkerBinding = serde_json::from_value(json).unwrap();
        assert_eq!(back, binding);
    }

    #[test]
    fn invalid_binding_fails_to_load() {
        let raw = r#"{"event_type": "phase_start", "marker_template": "1$"}"#;
        assert!(serde_json::from_str::<MarkerBinding>(raw).is_err());
    }

    #[test]
    fn participant_filter() {
        let p2_only = MarkerBinding::new("video_p2_end", "220#", Some(Participant::P2)).unwrap();
        assert!(p2_only.matches("video_p2_end", Some(Participant::P2)));
        assert!(!p2_only.matches("video_p2_end", Some(Participant::P1)));
        assert!(p2_only.matches("video_p2_end", None));
        assert!(!p2_only.matches("video_p1_end", None));
    }
}
