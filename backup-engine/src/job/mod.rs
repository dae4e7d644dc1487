//! Job descriptions as submitted by the front-end.

pub mod naming;
pub mod state;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::fs::ExcludeSet;
use crate::policy::ErrorPolicy;
use crate::utils::errors::EngineError;

pub use state::{JobState, JobStatus};

pub type JobId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    Age,
    Gpg,
}

/// Passphrase, recipient or identity file. Never logged, never serialized.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// A backup or restore request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    /// Empty means `<DD_MON>_BACKUP`
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub direction: Direction,

    /// Ordered inclusion paths (backup)
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Glob exclude patterns (backup)
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub encryption: Encryption,

    #[serde(default)]
    pub secret: Option<Secret>,

    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// One archive per immediate subdirectory of the single inclusion path
    #[serde(default)]
    pub split: bool,

    /// Emit per-file events
    #[serde(default)]
    pub live_file_progress: bool,

    /// Archive to restore from: a file name under the backups directory or an
    /// absolute path
    #[serde(default)]
    pub archive: Option<PathBuf>,

    /// Restore root; the configured restore directory when unset
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl JobSpec {
    pub fn backup(name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Backup,
            paths,
            ..Default::default()
        }
    }

    pub fn restore(archive: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Restore,
            archive: Some(archive.into()),
            destination: Some(destination.into()),
            ..Default::default()
        }
    }

    pub fn with_exclude(mut self, patterns: &[&str]) -> Self {
        self.exclude = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_encryption(mut self, encryption: Encryption, secret: impl Into<String>) -> Self {
        self.encryption = encryption;
        self.secret = Some(Secret::new(secret));
        self
    }

    pub fn with_split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    pub fn with_live_file_progress(mut self, enabled: bool) -> Self {
        self.live_file_progress = enabled;
        self
    }

    /// Encryption actually applied. Restores of `.age`/`.gpg` archives
    /// submitted with `none` pick the matching decryptor.
    pub fn effective_encryption(&self) -> Encryption {
        match (self.direction, self.encryption, &self.archive) {
            (Direction::Restore, Encryption::None, Some(archive)) => naming::infer_encryption(archive),
            (_, encryption, _) => encryption,
        }
    }

    /// Job name with the date-based default applied
    pub fn display_name(&self) -> String {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            naming::default_job_name(chrono::Local::now())
        } else {
            trimmed.to_string()
        }
    }

    fn secret_missing(&self) -> bool {
        self.secret.as_ref().is_none_or(Secret::is_empty)
    }

    /// Reject specs that cannot run, before any job state is created
    pub fn validate(&self) -> crate::Result<()> {
        match self.direction {
            Direction::Backup => {
                if self.paths.iter().all(|p| p.as_os_str().is_empty()) {
                    return Err(EngineError::InvalidSpec("backup needs at least one path".into()));
                }
                ExcludeSet::new(&self.exclude).map_err(|e| EngineError::InvalidSpec(e.to_string()))?;
                match self.encryption {
                    Encryption::None => {}
                    Encryption::Age if self.secret_missing() => {
                        return Err(EngineError::InvalidSpec(
                            "age encryption requires a passphrase or recipient".into(),
                        ))
                    }
                    Encryption::Gpg if self.secret_missing() => {
                        return Err(EngineError::InvalidSpec("gpg encryption requires a recipient".into()))
                    }
                    _ => {}
                }
            }
            Direction::Restore => {
                if self.split {
                    return Err(EngineError::InvalidSpec("split mode only applies to backups".into()));
                }
                if self.archive.as_ref().is_none_or(|a| a.as_os_str().is_empty()) {
                    return Err(EngineError::InvalidSpec("restore needs an archive".into()));
                }
                if self.effective_encryption() == Encryption::Age && self.secret_missing() {
                    return Err(EngineError::InvalidSpec(
                        "age decryption requires a passphrase or identity file".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserialization_defaults() {
        let spec: JobSpec = serde_json::from_str(r#"{"paths": ["/data"]}"#).unwrap();
        assert_eq!(spec.direction, Direction::Backup);
        assert_eq!(spec.encryption, Encryption::None);
        assert_eq!(spec.error_policy, ErrorPolicy::Ignore);
        assert!(!spec.split);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_secret_is_redacted() {
        let spec: JobSpec = serde_json::from_str(
            r#"{"paths": ["/data"], "encryption": "age", "secret": "hunter2", "error_policy": "abort"}"#,
        )
        .unwrap();
        assert_eq!(spec.error_policy, ErrorPolicy::Abort);
        assert_eq!(spec.secret.as_ref().unwrap().expose(), "hunter2");
        assert!(!format!("{:?}", spec).contains("hunter2"));
    }

    #[test]
    fn test_validation() {
        assert!(JobSpec::backup("x", vec![]).validate().is_err());
        assert!(JobSpec::backup("x", vec!["/data".into()])
            .with_exclude(&["[bad"])
            .validate()
            .is_err());

        let mut age = JobSpec::backup("x", vec!["/data".into()]);
        age.encryption = Encryption::Age;
        assert!(matches!(age.validate(), Err(EngineError::InvalidSpec(_))));

        let restore = JobSpec::restore("a.tar.zst", "/tmp/out").with_split(true);
        assert!(restore.validate().is_err());

        let mut restore = JobSpec::restore("a.tar.zst", "/tmp/out");
        restore.archive = None;
        assert!(restore.validate().is_err());
    }

    #[test]
    fn test_restore_infers_encryption() {
        let spec = JobSpec::restore("NIGHTLY.tar.zst.gpg", "/tmp/out");
        assert_eq!(spec.effective_encryption(), Encryption::Gpg);
        assert!(spec.validate().is_ok());

        let spec = JobSpec::restore("NIGHTLY.tar.zst.age", "/tmp/out");
        assert_eq!(spec.effective_encryption(), Encryption::Age);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_display_name_default() {
        let spec = JobSpec::backup("  ", vec!["/data".into()]);
        assert!(spec.display_name().ends_with("_BACKUP"));
        assert_eq!(JobSpec::backup("nightly", vec![]).display_name(), "nightly");
    }
}
