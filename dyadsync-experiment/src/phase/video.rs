//! Synchronized dual video: the only phase that preloads.

use super::{ChannelPair, Phase, fill, render_error};
use crate::duration::DurationEstimate;
use crate::error::{EngineError, ResourceError, Result};
use crate::resources::{PlaybackChannel, Prompt};
use crate::runtime::Runtime;
use dyadsync_core::{
    FrameSummary, Participant, PhaseOutcome, SyncSummary, TrialData, VideoResult,
    template_variables,
};
use dyadsync_timing::{FrameTimes, Nanos, SyncReport, diff_ms};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoParams {
    /// Path or `{column}` template.
    #[serde(default)]
    pub participant_1_video: String,
    #[serde(default)]
    pub participant_2_video: String,
    /// Move on as soon as both videos end instead of waiting for a key.
    #[serde(default = "yes")]
    pub auto_advance: bool,
}

impl VideoParams {
    pub fn new(p1: impl Into<String>, p2: impl Into<String>) -> Self {
        Self {
            participant_1_video: p1.into(),
            participant_2_video: p2.into(),
            auto_advance: true,
        }
    }

    fn is_template(path: &str) -> bool {
        !template_variables(path).is_empty()
    }

    /// Concrete paths; an unrendered template is an error.
    pub(super) fn paths(&self, phase: &str) -> Result<[&str; 2]> {
        let paths = [
            self.participant_1_video.as_str(),
            self.participant_2_video.as_str(),
        ];
        if let Some(t) = paths.iter().find(|p| Self::is_template(p)) {
            return Err(render_error(phase, format!("unrendered video path '{t}'")));
        }
        Ok(paths)
    }

    /// File existence is checked separately by media validation.
    pub(super) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.participant_1_video.trim().is_empty() {
            errors.push("Participant 1 video path is empty".to_string());
        }
        if self.participant_2_video.trim().is_empty() {
            errors.push("Participant 2 video path is empty".to_string());
        }
        errors
    }

    pub(super) fn variables(&self) -> BTreeSet<String> {
        template_variables(&self.participant_1_video)
            .into_iter()
            .chain(template_variables(&self.participant_2_video))
            .collect()
    }

    pub(super) fn render(&self, phase: &str, data: &TrialData) -> Result<Self> {
        Ok(Self {
            participant_1_video: fill(phase, &self.participant_1_video, data)?,
            participant_2_video: fill(phase, &self.participant_2_video, data)?,
            auto_advance: self.auto_advance,
        })
    }

    pub(super) fn estimate(&self) -> DurationEstimate {
        if Self::is_template(&self.participant_1_video)
            || Self::is_template(&self.participant_2_video)
        {
            return DurationEstimate::Variable;
        }
        DurationEstimate::Probed {
            p1: self.participant_1_video.clone(),
            p2: self.participant_2_video.clone(),
        }
    }
}

pub(super) fn run(
    phase: &Phase,
    params: &VideoParams,
    rt: &mut Runtime,
    data: &TrialData,
) -> Result<PhaseOutcome> {
    let mut pair = phase
        .take_channels()
        .ok_or_else(|| EngineError::NotPrepared(phase.name.clone()))?;
    let entered = rt.now();

    let played = play(phase, params, rt, data, &mut pair, entered);

    for channel in pair.iter_mut() {
        channel.stop();
    }
    drop(pair);
    info!("{}: channels released", phase.name);
    played
}

fn play(
    phase: &Phase,
    params: &VideoParams,
    rt: &mut Runtime,
    data: &TrialData,
    pair: &mut ChannelPair,
    entered: Nanos,
) -> Result<PhaseOutcome> {
    if let Some(at) = phase.sync_timestamp().filter(|&at| at > rt.now()) {
        rt.engine.wait_until(at);
    }

    let report = {
        let [p1, p2] = pair;
        let mut channels: [&mut dyn PlaybackChannel; 2] = [p1.as_mut(), p2.as_mut()];
        rt.engine.trigger_synchronized_playback(&mut channels)?
    };
    if report.started() == 0 {
        return Err(ResourceError::Channel(format!("{}: no channel started", phase.name)).into());
    }
    let started = rt.now();
    let onset_delay_ms = diff_ms(started, entered);
    info!("{}: playback started, onset delay {onset_delay_ms:.2} ms", phase.name);
    phase.emit(rt, "video_start", None, data, None);

    let mut ended: [Option<f64>; 2] = [None, None];
    for (i, start) in report.actual_starts.iter().enumerate() {
        if start.is_none() {
            warn!("{}: channel {} never started", phase.name, i + 1);
            ended[i] = Some(0.0);
        }
    }

    let mut frames = FrameTimes::default();
    let mut last_frame: Option<Nanos> = None;
    while ended.iter().any(Option::is_none) {
        let now = rt.tick(None)?;
        for (i, who) in Participant::BOTH.into_iter().enumerate() {
            if ended[i].is_some() {
                continue;
            }
            let channel = &mut pair[i];
            if let Some(frame) = channel.get_frame() {
                rt.surfaces.present(who, &frame);
                if who == Participant::P1 {
                    if let Some(prev) = last_frame {
                        frames.record(Duration::from_nanos(now - prev));
                    }
                    last_frame = Some(now);
                }
            }
            if channel.is_finished() {
                ended[i] = Some(diff_ms(now, started) / 1000.0);
                let event = match who {
                    Participant::P1 => "video_p1_end",
                    Participant::P2 => "video_p2_end",
                };
                phase.emit(rt, event, Some(who), data, None);
            }
        }
    }
    phase.emit(rt, "video_both_complete", None, data, None);
    let duration = diff_ms(rt.now(), started) / 1000.0;

    if !params.auto_advance {
        rt.wait_for_key(&Prompt::AnyKey, None)?;
    }

    let stats = frames.stats();
    Ok(PhaseOutcome::Video(VideoResult {
        onset_delay_ms,
        sync: summarize(&report),
        p1_duration: ended[0].unwrap_or_default(),
        p2_duration: ended[1].unwrap_or_default(),
        duration,
        frames: FrameSummary {
            frames: stats.frames,
            average_frame_ms: stats.average_frame_time_ns / 1e6,
            jitter_ms: stats.jitter_ns / 1e6,
            effective_fps: stats.effective_fps,
        },
    }))
}

fn summarize(report: &SyncReport) -> SyncSummary {
    SyncSummary {
        sync_timestamp_ns: report.sync_timestamp,
        max_drift_ms: report.max_drift_ms,
        spread_ms: report.spread_ms,
        success: report.success,
        channels_started: report.started(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templated_paths_are_variable_until_rendered() {
        let params = VideoParams::new("{video1}", "{video2}");
        assert_eq!(params.estimate(), DurationEstimate::Variable);
        assert!(params.paths("Video").is_err());

        let data: TrialData = [
            ("video1".to_string(), "a.mp4".into()),
            ("video2".to_string(), "b.mp4".into()),
        ]
        .into_iter()
        .collect();
        let rendered = params.render("Video", &data).unwrap();
        assert_eq!(rendered.paths("Video").unwrap(), ["a.mp4", "b.mp4"]);
        assert!(matches!(rendered.estimate(), DurationEstimate::Probed { .. }));
    }

    #[test]
    fn empty_paths_are_reported() {
        let errors = VideoParams::new("", "b.mp4").validate();
        assert_eq!(errors, vec!["Participant 1 video path is empty"]);
    }

    #[test]
    fn auto_advance_defaults_on() {
        let params: VideoParams =
            serde_json::from_str(r#"{"participant_1_video": "a", "participant_2_video": "b"}"#)
                .unwrap();
        assert!(params.auto_advance);
    }
}
