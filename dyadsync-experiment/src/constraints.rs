//! Ordering constraints checked against a proposed trial order.

use dyadsync_core::{FieldValue, Trial};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    /// No run of equal `attribute` values longer than `limit`.
    /// With `value` set, only runs of that value count.
    MaxConsecutive {
        attribute: String,
        #[serde(default)]
        value: Option<FieldValue>,
        limit: usize,
    },
    /// Every value (or every listed value) appears equally often.
    Balance {
        attribute: String,
        #[serde(default)]
        values: Option<Vec<FieldValue>>,
    },
    /// The same value never reappears within `within` consecutive trials.
    NoRepeat {
        attribute: String,
        #[serde(rename = "within_trials")]
        within: usize,
    },
}

impl Constraint {
    pub fn check(&self, trials: &[&Trial]) -> bool {
        match self {
            Self::MaxConsecutive {
                attribute,
                value,
                limit,
            } => {
                let mut run = 0usize;
                let mut prev: Option<Option<&FieldValue>> = None;
                for trial in trials {
                    let current = trial.get(attribute);
                    let counts = value.as_ref().is_none_or(|v| current == Some(v));
                    run = match (counts, prev) {
                        (false, _) => 0,
                        (true, Some(p)) if p == current => run + 1,
                        (true, _) => 1,
                    };
                    if run > *limit {
                        return false;
                    }
                    prev = Some(current);
                }
                true
            }
            Self::Balance { attribute, values } => {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for trial in trials {
                    let current = trial.get(attribute);
                    if let Some(wanted) = values
                        && !current.is_some_and(|c| wanted.contains(c))
                    {
                        continue;
                    }
                    let key = current.map(FieldValue::to_string).unwrap_or_default();
                    *counts.entry(key).or_insert(0) += 1;
                }
                let mut it = counts.values();
                match it.next() {
                    Some(first) => it.all(|c| c == first),
                    None => true,
                }
            }
            Self::NoRepeat { attribute, within } => {
                for (i, trial) in trials.iter().enumerate() {
                    let current = trial.get(attribute);
                    let end = (i + within).min(trials.len());
                    if trials[i + 1..end.max(i + 1)]
                        .iter()
                        .any(|other| other.get(attribute) == current)
                    {
                        return false;
                    }
                }
                true
            }
        }
    }

    pub fn attribute(&self) -> &str {
        match self {
            Self::MaxConsecutive { attribute, .. }
            | Self::Balance { attribute, .. }
            | Self::NoRepeat { attribute, .. } => attribute,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxConsecutive {
                attribute,
                value: Some(v),
                limit,
            } => write!(f, "MaxConsecutive({attribute}={v}, limit={limit})"),
            Self::MaxConsecutive {
                attribute, limit, ..
            } => write!(f, "MaxConsecutive({attribute}, limit={limit})"),
            Self::Balance {
                attribute,
                values: Some(values),
            } => write!(f, "Balance({attribute}, values={values:?})"),
            Self::Balance { attribute, .. } => write!(f, "Balance({attribute})"),
            Self::NoRepeat { attribute, within } => {
                write!(f, "NoRepeat({attribute}, within={within})")
            }
        }
    }
}
