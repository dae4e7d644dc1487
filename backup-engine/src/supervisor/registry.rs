//! Single-flight registry of busy targets.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::utils::errors::EngineError;

/// Something a running job writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One artifact file, its `.partial` sibling included
    Artifact(PathBuf),
    /// A directory tree a restore writes into
    Tree(PathBuf),
}

impl Target {
    /// Two targets overlap when one job's writes could land in the other's
    fn overlaps(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Artifact(a), Target::Artifact(b)) => a == b,
            (Target::Tree(a), Target::Tree(b)) => a.starts_with(b) || b.starts_with(a),
            (Target::Artifact(file), Target::Tree(root)) | (Target::Tree(root), Target::Artifact(file)) => {
                file.starts_with(root)
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Artifact(path) => write!(f, "backup:{}", path.display()),
            Target::Tree(path) => write!(f, "restore:{}", path.display()),
        }
    }
}

struct Claim {
    target: Target,
    job_id: String,
}

/// Targets owned by running jobs
#[derive(Clone, Default)]
pub struct TargetRegistry {
    claims: Arc<Mutex<Vec<Claim>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every target for `job_id`, or none of them when one overlaps a
    /// target held by another job. The claim lasts as long as the guard.
    pub fn try_acquire(&self, targets: Vec<Target>, job_id: &str) -> crate::Result<TargetGuard> {
        let mut claims = lock(&self.claims);
        for target in &targets {
            if let Some(held) = claims.iter().find(|claim| claim.target.overlaps(target)) {
                return Err(EngineError::JobInProgress(format!(
                    "{} (held by job {})",
                    target, held.job_id
                )));
            }
        }
        claims.extend(targets.iter().map(|target| Claim {
            target: target.clone(),
            job_id: job_id.to_string(),
        }));

        Ok(TargetGuard {
            job_id: job_id.to_string(),
            targets,
            claims: Arc::clone(&self.claims),
        })
    }
}

/// Releases its targets when dropped
pub struct TargetGuard {
    job_id: String,
    targets: Vec<Target>,
    claims: Arc<Mutex<Vec<Claim>>>,
}

impl TargetGuard {
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        lock(&self.claims).retain(|claim| claim.job_id != self.job_id);
    }
}

fn lock(claims: &Mutex<Vec<Claim>>) -> MutexGuard<'_, Vec<Claim>> {
    match claims.lock() {
        Ok(claims) => claims,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(path: &str) -> Target {
        Target::Artifact(PathBuf::from(path))
    }

    fn tree(path: &str) -> Target {
        Target::Tree(PathBuf::from(path))
    }

    #[test]
    fn test_second_claim_is_rejected() {
        let registry = TargetRegistry::new();
        let guard = registry.try_acquire(vec![artifact("/b/nightly.tar.zst")], "job-1").unwrap();
        assert_eq!(guard.targets(), [artifact("/b/nightly.tar.zst")]);

        let err = registry.try_acquire(vec![artifact("/b/nightly.tar.zst")], "job-2").err().unwrap();
        assert!(matches!(err, EngineError::JobInProgress(_)));
        assert!(err.to_string().contains("job-1"));

        // Other targets are independent
        assert!(registry.try_acquire(vec![tree("/home/u")], "job-3").is_ok());
    }

    #[test]
    fn test_drop_releases_every_target() {
        let registry = TargetRegistry::new();
        let guard = registry
            .try_acquire(vec![artifact("/b/m_music.tar.zst"), artifact("/b/m_video.tar.zst")], "job-1")
            .unwrap();

        drop(guard);
        assert!(registry.try_acquire(vec![artifact("/b/m_video.tar.zst")], "job-2").is_ok());
    }

    #[test]
    fn test_overlapping_claim_takes_nothing() {
        let registry = TargetRegistry::new();
        let _single = registry.try_acquire(vec![artifact("/b/m_video.tar.zst")], "job-1").unwrap();

        let split = vec![artifact("/b/m_music.tar.zst"), artifact("/b/m_video.tar.zst")];
        assert!(registry.try_acquire(split, "job-2").is_err());

        // The free half of the rejected claim was not kept
        assert!(registry.try_acquire(vec![artifact("/b/m_music.tar.zst")], "job-3").is_ok());
    }

    #[test]
    fn test_nested_restore_roots_conflict() {
        let registry = TargetRegistry::new();
        let _home = registry.try_acquire(vec![tree("/home/u")], "job-1").unwrap();

        assert!(registry.try_acquire(vec![tree("/home/u/docs")], "job-2").is_err());
        assert!(registry.try_acquire(vec![tree("/home")], "job-3").is_err());
        assert!(registry.try_acquire(vec![artifact("/home/u/b/x.tar.zst")], "job-4").is_err());

        // Sibling with a common name prefix is a different tree
        assert!(registry.try_acquire(vec![tree("/home/user2")], "job-5").is_ok());
    }

    #[test]
    fn test_empty_claim_never_conflicts() {
        let registry = TargetRegistry::new();
        let _a = registry.try_acquire(Vec::new(), "download-1").unwrap();
        let _b = registry.try_acquire(Vec::new(), "download-2").unwrap();
        assert!(registry.try_acquire(vec![tree("/")], "job-3").is_ok());
    }
}
