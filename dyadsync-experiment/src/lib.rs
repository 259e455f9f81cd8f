//! Execution engine for dual-participant stimulus experiments.
//!
//! A [`Timeline`] runs [`Block`]s; a block drives its [`Procedure`] once per
//! trial; a procedure renders its [`Phase`]s against the trial's data and runs
//! them back to back, loading each video phase on the [`ContinuousPreloader`]
//! while the phase before it is still on screen.

pub mod block;
pub mod collector;
pub mod config;
pub mod constraints;
pub mod duration;
pub mod error;
pub mod phase;
pub mod preloader;
pub mod procedure;
pub mod resources;
pub mod runtime;
pub mod sim;
pub mod timeline;
pub mod trial_list;

pub use block::{Block, BlockKind, ExecutionObserver};
pub use collector::{JsonCollector, MemoryCollector, ResponseRecord, ResultCollector, ResultDocument};
pub use config::RuntimeConfig;
pub use constraints::Constraint;
pub use duration::{DurationEstimate, DurationTotal, UNKNOWN_DURATION};
pub use error::{CollectorError, EngineError, ResourceError, Result};
pub use phase::{Phase, PhaseKind, PhaseStatus, Templated};
pub use preloader::{ContinuousPreloader, PreloadStats};
pub use procedure::Procedure;
pub use resources::{
    Content, DurationProbe, InputSource, KeyPress, PlaybackChannel, Prompt, ResourceProvider,
    Resources, Surfaces, VideoFrame,
};
pub use runtime::{AbortHandle, MarkerEmitter, Runtime};
pub use timeline::{Timeline, TimelineMetadata};
pub use trial_list::{RandomizationConfig, RandomizationMethod, TrialList};
