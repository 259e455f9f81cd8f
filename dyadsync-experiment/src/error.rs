use dyadsync_timing::SyncError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("media not found: {0}")]
    MediaNotFound(PathBuf),

    #[error("cannot open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("output {0} is not available")]
    NoOutput(usize),

    #[error("channel failed: {0}")]
    Channel(String),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("result io: {0}")]
    Io(#[from] std::io::Error),

    #[error("result json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed:\n  {}", .0.join("\n  "))]
    Validation(Vec<String>),

    #[error("trial data has no trial_index; markers cannot be resolved")]
    MissingTrialIndex,

    #[error("phase '{0}' executed before its resources were loaded")]
    NotPrepared(String),

    #[error("phase '{0}' executed before it was armed")]
    NotArmed(String),

    #[error("cannot render phase '{phase}': {reason}")]
    Render { phase: String, reason: String },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error("execution aborted")]
    Aborted,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
