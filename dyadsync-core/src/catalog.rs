//! Named marker codes.
//!
//! A catalog is an ordinary value: open it from a file (or build the default code book),
//! pass it to whatever needs lookups, then `close` it to write changes back.

use crate::marker::{MarkerValue, TemplateError, validate_template_syntax};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CATALOG_VERSION: &str = "2.0";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog io: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("integer marker '{0}' has no code")]
    MissingCode(String),

    #[error("string marker '{0}' has no template pattern")]
    MissingPattern(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    #[default]
    Integer,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template_pattern: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub marker_type: MarkerKind,
}

impl MarkerDefinition {
    pub fn code(name: &str, description: &str, code: i64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            template_pattern: None,
            code: Some(code),
            marker_type: MarkerKind::Integer,
        }
    }

    pub fn templated(name: &str, description: &str, pattern: &str, code: i64) -> Self {
        Self {
            template_pattern: Some(pattern.to_string()),
            ..Self::code(name, description, code)
        }
    }

    pub fn string(name: &str, description: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            template_pattern: Some(pattern.to_string()),
            code: None,
            marker_type: MarkerKind::String,
        }
    }

    pub fn key(&self) -> Result<MarkerValue, CatalogError> {
        match self.marker_type {
            MarkerKind::Integer => self
                .code
                .map(MarkerValue::Int)
                .ok_or_else(|| CatalogError::MissingCode(self.name.clone())),
            MarkerKind::String => self
                .template_pattern
                .clone()
                .map(MarkerValue::Text)
                .ok_or_else(|| CatalogError::MissingPattern(self.name.clone())),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    version: String,
    markers: Vec<MarkerDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct MarkerCatalog {
    path: Option<PathBuf>,
    ints: BTreeMap<i64, MarkerDefinition>,
    strings: BTreeMap<String, MarkerDefinition>,
    dirty: bool,
}

impl MarkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock code book used by the dyadic recording setup.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        let defaults = [
            MarkerDefinition::code("Headset B16 to P1", "Participant 1 assigned headset B16", 9161),
            MarkerDefinition::code(
                "Headset B16 to P2",
                "Participant 1 assigned other headset, P2 is B16",
                9162,
            ),
            MarkerDefinition::code("Baseline Start", "Baseline fixation cross start", 8888),
            MarkerDefinition::code("Baseline End", "Baseline fixation cross end", 9999),
            MarkerDefinition::templated("Trial Start", "Trial begin", "100#", 1000),
            MarkerDefinition::templated("P1 Video End", "Video end for participant 1", "210#", 2100),
            MarkerDefinition::templated("P2 Video End", "Video end for participant 2", "220#", 2200),
            MarkerDefinition::templated(
                "P1 Rating",
                "Rating response for participant 1 (trial + rating)",
                "300#0$",
                30000,
            ),
            MarkerDefinition::templated(
                "P2 Rating",
                "Rating response for participant 2 (trial + rating)",
                "500#0$",
                50000,
            ),
        ];
        for definition in defaults {
            if let Some(code) = definition.code {
                catalog.ints.insert(code, definition);
            }
        }
        catalog.dirty = true;
        catalog
    }

    /// Load the catalog at `path`, or start from the defaults if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let mut catalog = if path.exists() {
            let doc: CatalogDocument = serde_json::from_str(&fs::read_to_string(path)?)?;
            let mut catalog = Self::new();
            for definition in doc.markers {
                catalog.insert(definition)?;
            }
            log::info!("loaded {} marker definitions from {}", catalog.len(), path.display());
            catalog
        } else {
            log::info!("no marker catalog at {}, using defaults", path.display());
            Self::with_defaults()
        };
        catalog.path = Some(path.to_path_buf());
        Ok(catalog)
    }

    /// Write pending changes back to the file this catalog was opened from.
    pub fn close(mut self) -> Result<(), CatalogError> {
        match self.path.clone() {
            Some(path) if self.dirty => self.save_to(&path),
            _ => Ok(()),
        }
    }

    pub fn save_to(&mut self, path: &Path) -> Result<(), CatalogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let doc = CatalogDocument {
            version: CATALOG_VERSION.to_string(),
            markers: self.definitions().into_iter().cloned().collect(),
        };
        fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        self.dirty = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ints.len() + self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `Ok(false)` if the key is already taken.
    pub fn add(&mut self, definition: MarkerDefinition) -> Result<bool, CatalogError> {
        if !self.is_unique(&definition.key()?, None) {
            return Ok(false);
        }
        self.insert(definition)?;
        self.dirty = true;
        Ok(true)
    }

    pub fn update(
        &mut self,
        key: &MarkerValue,
        definition: MarkerDefinition,
    ) -> Result<bool, CatalogError> {
        let new_key = definition.key()?;
        if self.get(key).is_none() || !self.is_unique(&new_key, Some(key)) {
            return Ok(false);
        }
        self.remove(key);
        self.add(definition)
    }

    pub fn remove(&mut self, key: &MarkerValue) -> bool {
        let removed = match key {
            MarkerValue::Int(code) => self.ints.remove(code).is_some(),
            MarkerValue::Text(pattern) => self.strings.remove(pattern).is_some(),
        };
        self.dirty |= removed;
        removed
    }

    pub fn get(&self, key: &MarkerValue) -> Option<&MarkerDefinition> {
        match key {
            MarkerValue::Int(code) => self.ints.get(code),
            MarkerValue::Text(pattern) => self.strings.get(pattern),
        }
    }

    pub fn is_unique(&self, key: &MarkerValue, exclude: Option<&MarkerValue>) -> bool {
        exclude == Some(key) || self.get(key).is_none()
    }

    pub fn find_by_template(&self, template: &str) -> Option<&MarkerDefinition> {
        self.ints
            .values()
            .find(|d| d.template_pattern.as_deref() == Some(template))
            .or_else(|| self.strings.get(template))
    }

    /// Human-readable name for a sent marker: exact code first, then template patterns.
    pub fn name_of(&self, marker: &MarkerValue) -> String {
        if let Some(definition) = self.get(marker) {
            return definition.name.clone();
        }
        let text = marker.to_string();
        self.template_definitions()
            .into_iter()
            .find(|d| {
                d.template_pattern
                    .as_deref()
                    .is_some_and(|p| pattern_matches(p, &text))
            })
            .map(|d| d.name.clone())
            .unwrap_or(text)
    }

    /// Integer markers by code, then string markers by name.
    pub fn definitions(&self) -> Vec<&MarkerDefinition> {
        let mut strings: Vec<&MarkerDefinition> = self.strings.values().collect();
        strings.sort_by(|a, b| a.name.cmp(&b.name));
        self.ints.values().chain(strings).collect()
    }

    pub fn template_definitions(&self) -> Vec<&MarkerDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| d.template_pattern.is_some())
            .collect()
    }

    fn insert(&mut self, definition: MarkerDefinition) -> Result<(), CatalogError> {
        if let Some(pattern) = &definition.template_pattern {
            validate_template_syntax(pattern)?;
        }
        match definition.key()? {
            MarkerValue::Int(code) => {
                self.ints.insert(code, definition);
            }
            MarkerValue::Text(pattern) => {
                self.strings.insert(pattern, definition);
            }
        }
        Ok(())
    }
}

/// Whether a resolved marker could have come from `pattern`.
/// `#`/`$` stand for one or more digits, `{var}` for one or more word characters.
fn pattern_matches(pattern: &str, marker: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        Lit(char),
        Digits,
        Word,
    }

    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '#' | '$' => toks.push(Tok::Digits),
            '{' => {
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                }
                toks.push(Tok::Word);
            }
            other => toks.push(Tok::Lit(other)),
        }
    }

    fn go(toks: &[Tok], s: &[char]) -> bool {
        let Some((first, rest)) = toks.split_first() else {
            return s.is_empty();
        };
        match *first {
            Tok::Lit(c) => s.first() == Some(&c) && go(rest, &s[1..]),
            Tok::Digits | Tok::Word => {
                let accepts = |c: &char| match first {
                    Tok::Digits => c.is_ascii_digit(),
                    _ => c.is_alphanumeric() || *c == '_' || *c == '-',
                };
                let run = s.iter().take_while(|c| accepts(c)).count();
                (1..=run).rev().any(|n| go(rest, &s[n..]))
            }
        }
    }

    let text: Vec<char> = marker.chars().collect();
    go(&toks, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_code_then_template_lookup() {
        let catalog = MarkerCatalog::with_defaults();
        assert_eq!(catalog.name_of(&MarkerValue::Int(8888)), "Baseline Start");
        assert_eq!(catalog.name_of(&MarkerValue::Int(1003)), "Trial Start");
        assert_eq!(catalog.name_of(&MarkerValue::Int(300307)), "P1 Rating");
        assert_eq!(catalog.name_of(&MarkerValue::Int(42)), "42");
    }

    #[test]
    fn string_markers_match_by_pattern() {
        let mut catalog = MarkerCatalog::new();
        assert!(
            catalog
                .add(MarkerDefinition::string("Video Start", "", "{type}_start"))
                .unwrap()
        );
        assert!(
            !catalog
                .add(MarkerDefinition::string("Dup", "", "{type}_start"))
                .unwrap()
        );
        assert_eq!(catalog.name_of(&MarkerValue::from("happy_start")), "Video Start");
        assert_eq!(catalog.name_of(&MarkerValue::from("happy_end")), "happy_end");
    }

    #[test]
    fn update_moves_the_key() {
        let mut catalog = MarkerCatalog::with_defaults();
        let moved = MarkerDefinition::code("Baseline Start", "moved", 8887);
        assert!(catalog.update(&MarkerValue::Int(8888), moved).unwrap());
        assert!(catalog.get(&MarkerValue::Int(8888)).is_none());
        assert_eq!(catalog.name_of(&MarkerValue::Int(8887)), "Baseline Start");
    }

    #[test]
    fn open_close_round_trip() {
        let dir = std::env::temp_dir().join(format!("dyadsync-catalog-{}", std::process::id()));
        let path = dir.join("markers.json");
        let _ = fs::remove_file(&path);

        let mut catalog = MarkerCatalog::open(&path).unwrap();
        assert_eq!(catalog.len(), 9);
        catalog
            .add(MarkerDefinition::code("Custom", "", 7777))
            .unwrap();
        catalog.close().unwrap();

        let reopened = MarkerCatalog::open(&path).unwrap();
        assert_eq!(reopened.len(), 10);
        assert_eq!(reopened.name_of(&MarkerValue::Int(7777)), "Custom");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_template_is_rejected() {
        let mut catalog = MarkerCatalog::new();
        let bad = MarkerDefinition::templated("Bad", "", "1$", 1);
        assert!(matches!(catalog.add(bad), Err(CatalogError::Template(_))));
    }
}
