//! Error policy controller.
//!
//! Every stage reports its errors here. Per-entry I/O errors are either
//! recorded and skipped (`ignore`) or turned into an abort of the pipeline
//! (`abort`); everything else always aborts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::utils::errors::{EngineError, ErrorKind};

/// User-chosen behavior for per-entry I/O errors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    #[default]
    Ignore,
    Abort,
}

/// Where in the job an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Selection,
    Source,
    Archive,
    Compress,
    Encrypt,
    Decrypt,
    Decompress,
    Unarchive,
    Sink,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Selection => "selection",
            StageName::Source => "source",
            StageName::Archive => "archive",
            StageName::Compress => "compress",
            StageName::Encrypt => "encrypt",
            StageName::Decrypt => "decrypt",
            StageName::Decompress => "decompress",
            StageName::Unarchive => "unarchive",
            StageName::Sink => "sink",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed entry or stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub stage: StageName,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(path: impl Into<PathBuf>, stage: StageName, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stage,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only list of failures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureReport {
    records: Vec<FailureRecord>,
}

impl FailureReport {
    pub fn push(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, other: FailureReport) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Applies the error policy for one pipeline (one split unit).
///
/// Aborting cancels `cancel`, which every stage of the unit observes. The
/// first abort cause wins; later errors are consequences of the teardown.
pub struct ErrorPolicyController {
    policy: ErrorPolicy,
    cancel: CancellationToken,
    report: Mutex<FailureReport>,
    cause: Mutex<Option<EngineError>>,
}

impl ErrorPolicyController {
    pub fn new(policy: ErrorPolicy, cancel: CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            report: Mutex::new(FailureReport::default()),
            cause: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Handle a read/permission error on a single entry.
    ///
    /// Returns `Ok(())` when the entry should be skipped and the job continue.
    pub fn on_entry_error(&self, path: &Path, stage: StageName, err: std::io::Error) -> crate::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.record(FailureRecord::new(path, stage, ErrorKind::PerEntryIo, err.to_string()));

        match self.policy {
            ErrorPolicy::Ignore => {
                warn!("Skipping {} ({}): {}", path.display(), stage, err);
                Ok(())
            }
            ErrorPolicy::Abort => {
                error!("Aborting on {} ({}): {}", path.display(), stage, err);
                let abort = EngineError::PerEntryIo {
                    path: path.to_path_buf(),
                    stage,
                    source: std::io::Error::new(err.kind(), err.to_string()),
                };
                self.set_cause(abort);
                Err(EngineError::PerEntryIo {
                    path: path.to_path_buf(),
                    stage,
                    source: err,
                })
            }
        }
    }

    /// Handle an error that ends a stage. Always aborts the unit.
    ///
    /// Cancellation is not a cause, and per-entry errors were already routed
    /// through [`Self::on_entry_error`].
    pub fn on_stage_error(&self, path: &Path, err: EngineError) {
        match err {
            EngineError::Cancelled | EngineError::PerEntryIo { .. } => {}
            err => {
                let first = self.cause.lock().map(|c| c.is_none()).unwrap_or(false);
                if first && !self.cancel.is_cancelled() {
                    error!("{}", err);
                    let stage = match &err {
                        EngineError::StageStart { stage, .. } | EngineError::PipelineFatal { stage, .. } => *stage,
                        _ => StageName::Selection,
                    };
                    self.record(FailureRecord::new(path, stage, err.kind(), err.to_string()));
                    self.set_cause(err);
                } else {
                    tracing::debug!("Secondary stage error: {}", err);
                }
            }
        }
    }

    /// Why the unit was aborted, if it was
    pub fn take_cause(&self) -> Option<EngineError> {
        self.cause.lock().ok().and_then(|mut c| c.take())
    }

    pub fn has_cause(&self) -> bool {
        self.cause.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    pub fn report(&self) -> FailureReport {
        self.report.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn failure_count(&self) -> usize {
        self.report.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn record(&self, record: FailureRecord) {
        if let Ok(mut report) = self.report.lock() {
            report.push(record);
        }
    }

    fn set_cause(&self, err: EngineError) {
        if let Ok(mut cause) = self.cause.lock() {
            if cause.is_none() {
                *cause = Some(err);
            }
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_ignore_records_and_continues() {
        let token = CancellationToken::new();
        let controller = ErrorPolicyController::new(ErrorPolicy::Ignore, token.clone());

        let res = controller.on_entry_error(
            Path::new("/data/secret"),
            StageName::Archive,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );

        assert!(res.is_ok());
        assert!(!token.is_cancelled());
        assert!(!controller.has_cause());

        let report = controller.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report.records()[0].path, PathBuf::from("/data/secret"));
        assert_eq!(report.records()[0].stage, StageName::Archive);
        assert_eq!(report.records()[0].kind, ErrorKind::PerEntryIo);
    }

    #[test]
    fn test_abort_cancels_and_keeps_first_cause() {
        let token = CancellationToken::new();
        let controller = ErrorPolicyController::new(ErrorPolicy::Abort, token.clone());

        let res = controller.on_entry_error(
            Path::new("/data/a"),
            StageName::Selection,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(res, Err(EngineError::PerEntryIo { .. })));
        assert!(token.is_cancelled());

        // Teardown errors after the abort are not recorded
        controller.on_stage_error(Path::new("/out"), EngineError::fatal(StageName::Sink, "broken pipe"));
        assert_eq!(controller.failure_count(), 1);

        match controller.take_cause() {
            Some(EngineError::PerEntryIo { path, .. }) => assert_eq!(path, PathBuf::from("/data/a")),
            other => panic!("unexpected cause: {:?}", other),
        }
    }

    #[test]
    fn test_fatal_aborts_under_ignore() {
        let token = CancellationToken::new();
        let controller = ErrorPolicyController::new(ErrorPolicy::Ignore, token.clone());

        controller.on_stage_error(Path::new("/out.tar.zst"), EngineError::fatal(StageName::Sink, "disk full"));

        assert!(token.is_cancelled());
        assert!(controller.has_cause());
        let report = controller.report();
        assert_eq!(report.records()[0].kind, ErrorKind::PipelineFatal);
    }

    #[test]
    fn test_cancellation_is_not_a_cause() {
        let token = CancellationToken::new();
        let controller = ErrorPolicyController::new(ErrorPolicy::Abort, token.clone());

        controller.on_stage_error(Path::new("/out"), EngineError::Cancelled);
        assert!(!controller.has_cause());
        assert!(controller.report().is_empty());
    }
}
