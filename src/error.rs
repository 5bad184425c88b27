use std::path::PathBuf;

/// Failures surfaced by the adaptation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The domain root is missing or holds no recognised images.
    #[error("failed to index domain at {root}: {reason}")]
    Indexing { root: PathBuf, reason: String },

    /// A domain contributed zero samples to pairing.
    #[error("{domain} corpus is empty")]
    EmptyCorpus { domain: &'static str },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The two branches disagree on the flattened feature width.
    #[error("feature width mismatch: source branch yields {source_width}, target branch yields {target_width}, expected {expected}")]
    ShapeMismatch {
        source_width: usize,
        target_width: usize,
        expected: usize,
    },

    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A run operation was called out of order.
    #[error("cannot {action} while the run is {phase}")]
    InvalidPhase { action: &'static str, phase: String },

    #[error("model record error: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
