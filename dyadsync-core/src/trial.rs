use crate::outcome::PhaseResults;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field carrying the 1-based position of a trial within its block run.
pub const TRIAL_INDEX: &str = "trial_index";
pub const TRIAL_ID: &str = "trial_id";

/// Source column spellings folded onto a canonical name. The original column is kept.
pub const FIELD_ALIASES: &[(&str, &str)] = &[
    ("VideoPath1", "video1"),
    ("VideoPath2", "video2"),
    ("Video1", "video1"),
    ("Video2", "video2"),
    ("video_1", "video1"),
    ("video_2", "video2"),
    ("videopath1", "video1"),
    ("videopath2", "video2"),
];

/// A single cell of trial data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Field name to value, in source column order.
pub type TrialData = IndexMap<String, FieldValue>;

pub fn trial_index(data: &TrialData) -> Option<i64> {
    data.get(TRIAL_INDEX).and_then(FieldValue::as_i64)
}

/// Add canonical aliases for known column spellings without overwriting existing keys.
pub fn normalize_fields(mut data: TrialData) -> TrialData {
    for (source, canonical) in FIELD_ALIASES {
        if data.contains_key(*canonical) {
            continue;
        }
        if let Some(value) = data.get(*source).cloned() {
            log::debug!("field alias {source} -> {canonical}");
            data.insert(canonical.to_string(), value);
        }
    }
    data
}

/// Seconds since the unix epoch.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// One row of stimulus data plus whatever execution recorded against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: usize,
    pub fields: TrialData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PhaseResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<f64>,
}

impl Trial {
    pub fn new(id: usize, fields: TrialData) -> Self {
        Self {
            id,
            fields,
            result: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn mark_start(&mut self) {
        self.started_at = Some(wall_clock_secs());
    }

    pub fn mark_end(&mut self) {
        self.ended_at = Some(wall_clock_secs());
    }

    pub fn duration_secs(&self) -> Option<f64> {
        Some(self.ended_at? - self.started_at?)
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_fill_canonical_keys_once() {
        let mut row = TrialData::new();
        row.insert("VideoPath1".into(), "a.mp4".into());
        row.insert("video_2".into(), "b.mp4".into());
        row.insert("video2".into(), "kept.mp4".into());

        let row = normalize_fields(row);
        assert_eq!(row["video1"], FieldValue::from("a.mp4"));
        assert_eq!(row["video2"], FieldValue::from("kept.mp4"));
        assert!(row.contains_key("VideoPath1"));
    }

    #[test]
    fn untagged_values_keep_their_shape() {
        let row: TrialData =
            serde_json::from_str(r#"{"block": 2, "gain": 0.5, "emotion": "happy"}"#).unwrap();
        assert_eq!(row["block"], FieldValue::Int(2));
        assert_eq!(row["gain"], FieldValue::Float(0.5));
        assert_eq!(row["emotion"].as_str(), Some("happy"));
    }

    #[test]
    fn trial_index_accepts_numeric_text() {
        let mut row = TrialData::new();
        row.insert(TRIAL_INDEX.into(), "4".into());
        assert_eq!(trial_index(&row), Some(4));
    }
}
