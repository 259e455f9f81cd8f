use crate::marker::Participant;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Phase results of one procedure run, keyed by phase name in execution order.
pub type PhaseResults = IndexMap<String, PhaseOutcome>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Timed(TimedResult),
    Video(VideoResult),
    Rating(RatingResult),
    Instruction(InstructionResult),
}

impl PhaseOutcome {
    pub fn as_rating(&self) -> Option<&RatingResult> {
        match self {
            Self::Rating(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoResult> {
        match self {
            Self::Video(v) => Some(v),
            _ => None,
        }
    }
}

/// Fixation and baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedResult {
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub sync_timestamp_ns: u64,
    pub max_drift_ms: f64,
    pub spread_ms: f64,
    pub success: bool,
    pub channels_started: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub frames: usize,
    pub average_frame_ms: f64,
    pub jitter_ms: f64,
    pub effective_fps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResult {
    /// Time from entering the phase to both channels running.
    pub onset_delay_ms: f64,
    pub sync: SyncSummary,
    pub p1_duration: f64,
    pub p2_duration: f64,
    pub duration: f64,
    pub frames: FrameSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingResult {
    pub p1_response: Option<i64>,
    /// Seconds from question onset.
    pub p1_rt: Option<f64>,
    pub p2_response: Option<i64>,
    pub p2_rt: Option<f64>,
}

impl RatingResult {
    pub fn response(&self, who: Participant) -> Option<(i64, Option<f64>)> {
        match who {
            Participant::P1 => self.p1_response.map(|r| (r, self.p1_rt)),
            Participant::P2 => self.p2_response.map(|r| (r, self.p2_rt)),
        }
    }

    pub fn record(&mut self, who: Participant, response: i64, rt: f64) {
        match who {
            Participant::P1 => {
                self.p1_response = Some(response);
                self.p1_rt = Some(rt);
            }
            Participant::P2 => {
                self.p2_response = Some(response);
                self.p2_rt = Some(rt);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.p1_response.is_some() && self.p2_response.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionResult {
    pub key: Option<String>,
    pub duration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_tagged_by_kind() {
        let mut rating = RatingResult::default();
        rating.record(Participant::P2, 5, 1.25);
        let json = serde_json::to_value(PhaseOutcome::Rating(rating.clone())).unwrap();
        assert_eq!(json["kind"], "rating");
        assert_eq!(json["p2_response"], 5);
        assert_eq!(rating.response(Participant::P2), Some((5, Some(1.25))));
        assert_eq!(rating.response(Participant::P1), None);
        assert!(!rating.is_complete());
    }
}
