use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Timing knobs for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Delay between a phase starting and background loading of its successor.
    pub preload_delay_ms: u64,
    /// How far ahead of a phase boundary STAGE 2 arms the next phase.
    pub sync_lead_ms: u64,
    pub preload_wait_timeout_ms: u64,
    pub cancel_wait_ms: u64,
    pub shutdown_wait_ms: u64,
    /// A preload wait longer than this is reported as time-borrowing having failed.
    pub slow_preload_warn_ms: u64,
    pub max_sync_spread_ms: f64,
    pub frame_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preload_delay_ms: 200,
            sync_lead_ms: 150,
            preload_wait_timeout_ms: 10_000,
            cancel_wait_ms: 1_000,
            shutdown_wait_ms: 5_000,
            slow_preload_warn_ms: 50,
            max_sync_spread_ms: 5.0,
            frame_interval_ms: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `DYADSYNC_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            let Some(raw) = raw else { return };
            match raw.trim().parse() {
                Ok(v) => *slot = v,
                Err(_) => log::warn!("ignoring {key}={raw}: not a number"),
            }
        }

        const DELAY: &str = "DYADSYNC_PRELOAD_DELAY_MS";
        const LEAD: &str = "DYADSYNC_SYNC_LEAD_MS";
        const TIMEOUT: &str = "DYADSYNC_PRELOAD_TIMEOUT_MS";
        const SPREAD: &str = "DYADSYNC_MAX_SYNC_SPREAD_MS";

        parse(DELAY, get(DELAY), &mut self.preload_delay_ms);
        parse(LEAD, get(LEAD), &mut self.sync_lead_ms);
        parse(TIMEOUT, get(TIMEOUT), &mut self.preload_wait_timeout_ms);
        parse(SPREAD, get(SPREAD), &mut self.max_sync_spread_ms);
    }

    pub fn preload_delay(&self) -> Duration {
        Duration::from_millis(self.preload_delay_ms)
    }

    pub fn sync_lead(&self) -> Duration {
        Duration::from_millis(self.sync_lead_ms)
    }

    pub fn preload_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_wait_timeout_ms)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_document_keeps_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"sync_lead_ms": 120}"#).unwrap();
        assert_eq!(cfg.sync_lead_ms, 120);
        assert_eq!(cfg.preload_delay_ms, 200);
        assert_eq!(cfg.max_sync_spread_ms, 5.0);
    }

    #[test]
    fn env_overrides_skip_garbage() {
        let vars: HashMap<&str, &str> = [
            ("DYADSYNC_PRELOAD_DELAY_MS", "50"),
            ("DYADSYNC_MAX_SYNC_SPREAD_MS", "2.5"),
            ("DYADSYNC_SYNC_LEAD_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.preload_delay_ms, 50);
        assert_eq!(cfg.max_sync_spread_ms, 2.5);
        assert_eq!(cfg.sync_lead_ms, 150);
    }
}
