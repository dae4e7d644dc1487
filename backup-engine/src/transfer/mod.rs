//! Progress accounting for pipelines.

pub mod progress;
pub mod progress_stream;

pub use progress::{ProgressMeter, ProgressSnapshot, ProgressTracker};
