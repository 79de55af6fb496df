use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading or validating a route plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid plan JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("plan contains no waypoints")]
    Empty,
    #[error("segment {index} is missing dist_cm")]
    MissingDistance { index: usize },
    #[error("unsupported plan version {0}")]
    UnsupportedVersion(u32),
    #[error("no plan files found in {0}")]
    NoPlanFound(PathBuf),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Transport-level failures. The dispatcher folds these into
/// `CommandOutcome` values; they never reach the controllers.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link closed")]
    Closed,
    #[error("malformed reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("video stream unavailable: {0}")]
    StreamUnavailable(String),
    #[error("detector failed: {0}")]
    DetectorFailed(String),
}

/// Setup failures that stop a mission before the vehicle is commanded.
#[derive(Debug, Error)]
pub enum MissionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("journal sink error: {0}")]
    Journal(std::io::Error),
}
