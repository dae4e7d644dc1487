//! Error types for the backup engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::policy::StageName;

/// Classification of failures, as reported in failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Pattern, traversal or stat failure while resolving the selection
    Selection,
    /// An external transform could not be started
    StageStart,
    /// Read or permission error on a single entry
    PerEntryIo,
    /// Destination unwritable, disk full, broken pipeline
    PipelineFatal,
    /// Job cancelled by the user or the supervisor
    Cancelled,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Selection error: {0}")]
    Selection(String),

    #[error("Failed to start {stage} stage: {source}")]
    StageStart {
        stage: StageName,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} failed on {}: {source}", path.display())]
    PerEntryIo {
        path: PathBuf,
        stage: StageName,
        #[source]
        source: std::io::Error,
    },

    #[error("Pipeline failure in {stage}: {message}")]
    PipelineFatal { stage: StageName, message: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job already running for {0}")]
    JobInProgress(String),

    #[error("Invalid job: {0}")]
    InvalidSpec(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn fatal(stage: StageName, message: impl Into<String>) -> Self {
        EngineError::PipelineFatal {
            stage,
            message: message.into(),
        }
    }

    /// Taxonomy bucket of this error. Request-level errors count as selection
    /// failures since they prevent the job from resolving its inputs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Selection(_)
            | EngineError::InvalidSpec(_)
            | EngineError::JobNotFound(_)
            | EngineError::JobInProgress(_)
            | EngineError::Config(_) => ErrorKind::Selection,
            EngineError::StageStart { .. } => ErrorKind::StageStart,
            EngineError::PerEntryIo { .. } => ErrorKind::PerEntryIo,
            EngineError::PipelineFatal { .. } | EngineError::Io(_) => ErrorKind::PipelineFatal,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Errors that abort the whole job regardless of policy or split unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::StageStart | ErrorKind::PipelineFatal)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
