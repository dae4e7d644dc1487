//! Job state machine and the externally visible job status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::Direction;
use crate::policy::FailureReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    CompletedWithFailures,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedWithFailures | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompletedWithFailures => "completed_with_failures",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    fn can_become(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => next != JobState::Queued,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub name: String,
    pub direction: Direction,
    pub state: JobState,
    /// Human-readable outcome
    pub summary: String,
    /// Archives written, or the restore root
    pub artifacts: Vec<PathBuf>,
    pub failure_count: usize,
    pub failures: FailureReport,
    pub bytes_processed: u64,
    pub files_processed: usize,
    pub total_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn queued(job_id: impl Into<String>, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            direction,
            state: JobState::Queued,
            summary: "Queued".to_string(),
            artifacts: Vec::new(),
            failure_count: 0,
            failures: FailureReport::default(),
            bytes_processed: 0,
            files_processed: 0,
            total_bytes: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`. Returns `false`, leaving the status untouched, when
    /// the transition is not allowed; terminal states are final.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_become(next) {
            return false;
        }
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut status = JobStatus::queued("job-1", "nightly", Direction::Backup);
        assert!(!status.is_terminal());

        assert!(status.transition(JobState::Running));
        assert!(status.started_at.is_some());

        assert!(status.transition(JobState::CompletedWithFailures));
        assert!(status.finished_at.is_some());
        assert!(status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut status = JobStatus::queued("job-1", "nightly", Direction::Backup);
        assert!(status.transition(JobState::Cancelled));
        assert!(!status.transition(JobState::Running));
        assert!(!status.transition(JobState::Completed));
        assert_eq!(status.state, JobState::Cancelled);
    }

    #[test]
    fn test_running_cannot_go_back() {
        let mut status = JobStatus::queued("job-1", "nightly", Direction::Restore);
        assert!(status.transition(JobState::Running));
        assert!(!status.transition(JobState::Queued));
        assert!(!status.transition(JobState::Running));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&JobState::CompletedWithFailures).unwrap();
        assert_eq!(json, "\"completed_with_failures\"");
    }
}
