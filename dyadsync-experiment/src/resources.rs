//! Seams to the device layer: playback channels, output surfaces and input.
//!
//! The engine never decodes media or draws pixels itself. It asks a
//! [`ResourceProvider`] for one [`PlaybackChannel`] per participant, drives
//! the two [`Surfaces`] with coarse [`Content`], and polls an [`InputSource`].

use crate::error::ResourceError;
use dyadsync_core::Participant;
use dyadsync_timing::{Nanos, SyncTarget};
use std::path::Path;
use std::sync::Arc;

/// One decoded frame handed from a channel to its surface.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub index: u64,
    /// Presentation time in seconds from channel start.
    pub pts: f64,
}

/// An armed-then-triggered media player bound to one output.
pub trait PlaybackChannel: SyncTarget + Send {
    /// STAGE 1 work: open and decode ahead of time.
    fn prepare(&mut self) -> Result<(), ResourceError>;

    /// Next frame due for display, if any.
    fn get_frame(&mut self) -> Option<VideoFrame>;

    fn is_finished(&self) -> bool;

    /// Media length in seconds, when known.
    fn duration_secs(&self) -> Option<f64>;

    fn stop(&mut self);
}

pub trait ResourceProvider: Send + Sync {
    fn create_channel(
        &self,
        path: &Path,
        output_index: usize,
    ) -> Result<Box<dyn PlaybackChannel>, ResourceError>;

    fn media_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Length of a media file in seconds, used by duration estimates.
pub trait DurationProbe {
    fn probe(&self, path: &str) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Blank,
    FixationCross,
    Text { text: String, font_size: u32 },
}

/// The two participant-facing displays.
pub trait Surfaces {
    fn show(&mut self, who: Participant, content: Content);

    fn present(&mut self, who: Participant, frame: &VideoFrame);

    fn clear(&mut self) {
        for who in Participant::BOTH {
            self.show(who, Content::Blank);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPress {
    /// Lowercase key name, e.g. `"space"`, `"q"`, `"7"`.
    pub key: String,
    pub at: Nanos,
}

impl KeyPress {
    pub fn new(key: impl Into<String>, at: Nanos) -> Self {
        Self {
            key: key.into().to_lowercase(),
            at,
        }
    }
}

/// What the running phase is currently waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    AnyKey,
    Key(String),
    Rating { scale_min: i64, scale_max: i64 },
}

pub trait InputSource {
    /// Called once when a phase starts waiting. Scripted sources use it to plan answers.
    fn expect(&mut self, _prompt: &Prompt, _now: Nanos) {}

    /// Key presses that arrived up to `now`.
    fn poll(&mut self, now: Nanos) -> Vec<KeyPress>;
}

/// Everything STAGE 1 needs, cheap to clone into the preload worker.
#[derive(Clone)]
pub struct Resources {
    pub provider: Arc<dyn ResourceProvider>,
    /// Audio output per participant, P1 first.
    pub audio_outputs: [usize; 2],
}

impl Resources {
    pub fn new(provider: Arc<dyn ResourceProvider>, audio_outputs: [usize; 2]) -> Self {
        Self {
            provider,
            audio_outputs,
        }
    }

    pub fn output_for(&self, who: Participant) -> usize {
        match who {
            Participant::P1 => self.audio_outputs[0],
            Participant::P2 => self.audio_outputs[1],
        }
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("audio_outputs", &self.audio_outputs)
            .finish_non_exhaustive()
    }
}
