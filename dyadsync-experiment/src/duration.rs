use crate::resources::DurationProbe;
use serde::Serialize;
use std::ops::AddAssign;

/// Sentinel returned by `estimated_seconds` for phases whose length depends on the participants.
pub const UNKNOWN_DURATION: f64 = -1.0;

/// How long a phase is expected to run.
#[derive(Debug, Clone, PartialEq)]
pub enum DurationEstimate {
    Fixed(f64),
    /// Length of the longer of two media files.
    Probed { p1: String, p2: String },
    Variable,
}

impl DurationEstimate {
    /// Seconds, if known. `Probed` needs a probe that can read both files.
    pub fn seconds(&self, probe: Option<&dyn DurationProbe>) -> Option<f64> {
        match self {
            Self::Fixed(s) => Some(*s),
            Self::Probed { p1, p2 } => {
                let probe = probe?;
                match (probe.probe(p1), probe.probe(p2)) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (Some(a), None) | (None, Some(a)) => Some(a),
                    (None, None) => None,
                }
            }
            Self::Variable => None,
        }
    }
}

/// Sum of known phase lengths plus a count of the ones that could not be estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationTotal {
    pub seconds: f64,
    pub unknown: usize,
}

impl DurationTotal {
    pub fn add(&mut self, estimate: &DurationEstimate, probe: Option<&dyn DurationProbe>) {
        match estimate.seconds(probe) {
            Some(s) if s > 0.0 => self.seconds += s,
            Some(_) => {}
            None => self.unknown += 1,
        }
    }

    pub fn times(self, n: usize) -> Self {
        Self {
            seconds: self.seconds * n as f64,
            unknown: self.unknown * n,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.unknown == 0
    }
}

impl AddAssign for DurationTotal {
    fn add_assign(&mut self, rhs: Self) {
        self.seconds += rhs.seconds;
        self.unknown += rhs.unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Table;

    impl DurationProbe for Table {
        fn probe(&self, path: &str) -> Option<f64> {
            match path {
                "a.mp4" => Some(12.0),
                "b.mp4" => Some(14.5),
                _ => None,
            }
        }
    }

    #[test]
    fn probed_takes_the_longer_file() {
        let e = DurationEstimate::Probed {
            p1: "a.mp4".into(),
            p2: "b.mp4".into(),
        };
        assert_eq!(e.seconds(Some(&Table)), Some(14.5));
        assert_eq!(e.seconds(None), None);
    }

    #[test]
    fn totals_count_unknown_phases() {
        let mut total = DurationTotal::default();
        total.add(&DurationEstimate::Fixed(3.0), None);
        total.add(&DurationEstimate::Variable, None);
        let block = total.times(4);
        assert_eq!(block.seconds, 12.0);
        assert_eq!(block.unknown, 4);
        assert!(!block.is_exact());
    }
}
