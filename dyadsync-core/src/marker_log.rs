use crate::marker::{MarkerValue, Participant};
use crate::trial::wall_clock_secs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Record of one marker that was pushed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerEvent {
    /// Wall clock, seconds since the unix epoch.
    pub timestamp: f64,
    /// Experiment timer reading when the marker was sent.
    pub elapsed_ns: u64,
    pub marker: MarkerValue,
    pub event_type: String,
    pub phase_name: String,
    pub trial_index: Option<i64>,
    pub participant: Option<Participant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerLog {
    pub session_id: String,
    pub session_start: f64,
    events: Vec<MarkerEvent>,
}

impl MarkerLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            session_start: wall_clock_secs(),
            events: Vec::new(),
        }
    }

    pub fn record(&mut self, event: MarkerEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[MarkerEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&MarkerEvent> {
        self.events.last()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn filter(
        &self,
        marker: Option<&MarkerValue>,
        event_type: Option<&str>,
        trial_index: Option<i64>,
    ) -> Vec<&MarkerEvent> {
        self.events
            .iter()
            .filter(|e| marker.is_none_or(|m| &e.marker == m))
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| trial_index.is_none_or(|i| e.trial_index == Some(i)))
            .collect()
    }

    /// How often each marker was sent, in first-seen order.
    pub fn counts(&self) -> IndexMap<MarkerValue, usize> {
        let mut counts = IndexMap::new();
        for e in &self.events {
            *counts.entry(e.marker.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Marker summary for session {}", self.session_id);
        let _ = writeln!(out, "Total events: {}", self.events.len());

        let mut counts: Vec<_> = self.counts().into_iter().collect();
        let _ = writeln!(out, "Unique markers: {}", counts.len());
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        for (marker, n) in counts {
            let _ = writeln!(out, "  {marker}: {n}");
        }

        let mut by_event: IndexMap<&str, usize> = IndexMap::new();
        for e in &self.events {
            *by_event.entry(e.event_type.as_str()).or_insert(0) += 1;
        }
        if !by_event.is_empty() {
            let _ = writeln!(out, "Events:");
            by_event.sort_by(|_, a, _, b| b.cmp(a));
            for (event, n) in by_event {
                let _ = writeln!(out, "  {event}: {n}");
            }
        }

        let mut trials: Vec<i64> = self.events.iter().filter_map(|e| e.trial_index).collect();
        trials.sort_unstable();
        trials.dedup();
        if !trials.is_empty() {
            let _ = writeln!(out, "Trials with markers: {trials:?}");
        }
        out
    }
}
