//! Arm/trigger synchronization of independent playback channels.

use crate::timer::{diff_ms, to_nanos, Nanos, SharedTimer};
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;

/// Channels armed further apart than this are rejected.
pub const MAX_ARM_SKEW_MS: f64 = 1.0;

/// Final stretch of [`SyncEngine::wait_until`] spent spinning instead of sleeping.
pub const SPIN_WINDOW: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no channels to trigger")]
    NoChannels,

    #[error("channel {index} is not armed; STAGE 2 must run before triggering")]
    NotArmed { index: usize },

    #[error("channel {index} armed {skew_ms:.3} ms away from channel 0")]
    ArmSkew { index: usize, skew_ms: f64 },
}

/// Something that can be armed for a deadline and then started.
pub trait SyncTarget {
    /// STAGE 2: remember the deadline without starting.
    fn arm(&mut self, at: Nanos);

    fn armed_at(&self) -> Option<Nanos>;

    /// Start immediately and clear the armed deadline.
    fn trigger(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    pub max_spread_ms: f64,
    pub max_arm_skew_ms: f64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_spread_ms: 5.0,
            max_arm_skew_ms: MAX_ARM_SKEW_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub sync_timestamp: Nanos,
    /// Per-channel start time, `None` where the trigger failed.
    pub actual_starts: Vec<Option<Nanos>>,
    pub max_drift_ms: f64,
    pub spread_ms: f64,
    pub success: bool,
}

impl SyncReport {
    pub fn started(&self) -> usize {
        self.actual_starts.iter().filter(|s| s.is_some()).count()
    }
}

#[derive(Debug, Clone)]
pub struct SyncEngine {
    timer: SharedTimer,
    policy: SyncPolicy,
}

impl SyncEngine {
    pub fn new(timer: SharedTimer) -> Self {
        Self::with_policy(timer, SyncPolicy::default())
    }

    pub fn with_policy(timer: SharedTimer, policy: SyncPolicy) -> Self {
        Self { timer, policy }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// A deadline `lead_ms` in the future.
    pub fn calculate_sync_timestamp(&self, lead_ms: f64) -> Nanos {
        let lead = Duration::try_from_secs_f64(lead_ms.max(0.0) / 1000.0).unwrap_or(Duration::MAX);
        self.timer.now().saturating_add(to_nanos(lead))
    }

    /// Coarse sleep, then spin through the last [`SPIN_WINDOW`]. Returns the wake time.
    pub fn wait_until(&self, deadline: Nanos) -> Nanos {
        let now = self.timer.now();
        let spin = to_nanos(SPIN_WINDOW);
        if deadline > now + spin {
            self.timer.sleep(Duration::from_nanos(deadline - now - spin));
        }
        self.timer.spin_until(deadline);
        self.timer.now()
    }

    /// Fire every armed channel back-to-back and measure how closely they started.
    ///
    /// All channels must be armed and agree on the deadline within
    /// [`SyncPolicy::max_arm_skew_ms`]; otherwise nothing is started.
    pub fn trigger_synchronized_playback<C: SyncTarget + ?Sized>(
        &self,
        channels: &mut [&mut C],
    ) -> Result<SyncReport, SyncError> {
        let first = channels.first().ok_or(SyncError::NoChannels)?;
        let target = first.armed_at().ok_or(SyncError::NotArmed { index: 0 })?;

        for (index, channel) in channels.iter().enumerate().skip(1) {
            let at = channel.armed_at().ok_or(SyncError::NotArmed { index })?;
            let skew_ms = diff_ms(at, target);
            if skew_ms.abs() > self.policy.max_arm_skew_ms {
                return Err(SyncError::ArmSkew { index, skew_ms });
            }
        }

        info!("triggering {} armed channels at t={target}ns", channels.len());

        let actual_starts = channels
            .iter_mut()
            .enumerate()
            .map(|(index, channel)| match channel.trigger() {
                Ok(()) => Some(self.timer.now()),
                Err(e) => {
                    log::error!("channel {index} failed to start: {e}");
                    None
                }
            })
            .collect();

        Ok(self.verify(actual_starts, target))
    }

    /// Compute a deadline, arm every channel, wait for it, then trigger.
    pub fn play_synchronized<C: SyncTarget + ?Sized>(
        &self,
        channels: &mut [&mut C],
        lead_ms: f64,
    ) -> Result<SyncReport, SyncError> {
        if lead_ms < 10.0 {
            warn!("sync lead of {lead_ms:.1} ms is very short, expect degraded sync");
        }
        let deadline = self.calculate_sync_timestamp(lead_ms);
        for channel in channels.iter_mut() {
            channel.arm(deadline);
        }
        self.wait_until(deadline);
        self.trigger_synchronized_playback(channels)
    }

    fn verify(&self, actual_starts: Vec<Option<Nanos>>, target: Nanos) -> SyncReport {
        let valid: Vec<Nanos> = actual_starts.iter().flatten().copied().collect();
        let (Some(&min), Some(&max)) = (valid.iter().min(), valid.iter().max()) else {
            log::error!("no channel started");
            return SyncReport {
                sync_timestamp: target,
                actual_starts,
                max_drift_ms: f64::INFINITY,
                spread_ms: f64::INFINITY,
                success: false,
            };
        };

        let max_drift_ms = valid
            .iter()
            .map(|&start| diff_ms(start, target).abs())
            .fold(0.0, f64::max);
        let spread_ms = diff_ms(max, min);
        let success = valid.len() == actual_starts.len()
            && max_drift_ms < self.policy.max_spread_ms
            && spread_ms < self.policy.max_spread_ms;

        if success {
            info!(
                "sync ok: max drift {max_drift_ms:.3} ms, spread {spread_ms:.3} ms, {}/{} channels",
                valid.len(),
                actual_starts.len()
            );
        } else {
            warn!(
                "sync degraded: max drift {max_drift_ms:.3} ms, spread {spread_ms:.3} ms, {}/{} channels",
                valid.len(),
                actual_starts.len()
            );
        }
        for (i, start) in actual_starts.iter().enumerate() {
            if let Some(start) = start {
                debug!("  channel {i}: {:+.3} ms from target", diff_ms(*start, target));
            }
        }

        SyncReport {
            sync_timestamp: target,
            actual_starts,
            max_drift_ms,
            spread_ms,
            success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{SimulatedTimer, Timer};

    #[derive(Default)]
    struct Probe {
        armed: Option<Nanos>,
        started: bool,
        fail: bool,
    }

    impl SyncTarget for Probe {
        fn arm(&mut self, at: Nanos) {
            self.armed = Some(at);
        }

        fn armed_at(&self) -> Option<Nanos> {
            self.armed
        }

        fn trigger(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.armed = None;
            if self.fail {
                return Err("device gone".into());
            }
            self.started = true;
            Ok(())
        }
    }

    #[test]
    fn sync_timestamp_is_in_the_future() {
        let timer = SimulatedTimer::new();
        timer.advance(Duration::from_millis(7));
        let engine = SyncEngine::new(timer.shared());
        assert_eq!(engine.calculate_sync_timestamp(150.0), 157_000_000);
    }

    #[test]
    fn unarmed_channel_is_rejected_before_anything_starts() {
        let engine = SyncEngine::new(SimulatedTimer::new().shared());
        let mut a = Probe::default();
        let mut b = Probe::default();
        a.arm(1_000);

        let err = engine
            .trigger_synchronized_playback(&mut [&mut a, &mut b])
            .unwrap_err();
        assert!(matches!(err, SyncError::NotArmed { index: 1 }));
        assert!(!a.started);
    }

    #[test]
    fn skewed_arming_is_rejected() {
        let engine = SyncEngine::new(SimulatedTimer::new().shared());
        let mut a = Probe::default();
        let mut b = Probe::default();
        a.arm(0);
        b.arm(2_000_000);

        let err = engine
            .trigger_synchronized_playback(&mut [&mut a, &mut b])
            .unwrap_err();
        assert!(matches!(err, SyncError::ArmSkew { index: 1, .. }));
    }

    #[test]
    fn play_synchronized_starts_on_the_deadline() {
        let timer = SimulatedTimer::new();
        let engine = SyncEngine::new(timer.shared());
        let mut a = Probe::default();
        let mut b = Probe::default();

        let report = engine
            .play_synchronized(&mut [&mut a, &mut b], 150.0)
            .unwrap();
        assert!(report.success);
        assert_eq!(report.sync_timestamp, 150_000_000);
        assert_eq!(report.max_drift_ms, 0.0);
        assert_eq!(report.started(), 2);
        assert!(a.started && b.started);
        assert_eq!(a.armed_at(), None);
        assert_eq!(timer.now(), 150_000_000);
    }

    #[test]
    fn failed_channel_marks_report_unsuccessful() {
        let engine = SyncEngine::new(SimulatedTimer::new().shared());
        let mut a = Probe::default();
        let mut b = Probe {
            fail: true,
            ..Probe::default()
        };

        let report = engine
            .play_synchronized(&mut [&mut a, &mut b], 20.0)
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.actual_starts[1], None);
        assert_eq!(report.started(), 1);
    }
}
