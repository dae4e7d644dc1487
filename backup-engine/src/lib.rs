//! Backup Engine Library
//!
//! Backup/restore job orchestration: path selection, streaming
//! tar → zstd → age/gpg pipelines, progress tracking, error policies and a
//! job supervisor, served over HTTP and WebSocket.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod job;
pub mod pipeline;
pub mod policy;
pub mod supervisor;
pub mod transfer;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use job::{JobSpec, JobState, JobStatus};
pub use supervisor::JobSupervisor;
pub use utils::errors::{EngineError, Result};
