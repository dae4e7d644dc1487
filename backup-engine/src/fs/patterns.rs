//! Exclude patterns.
//!
//! Patterns are shell globs matched against a path relative to its inclusion
//! root, and against the entry's final component. `*` crosses directory
//! separators. A trailing `/` restricts the pattern to directories and
//! everything beneath them.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::utils::errors::EngineError;

/// Compiled exclude patterns
#[derive(Debug, Clone)]
pub struct ExcludeSet {
    any: GlobSet,
    dirs: GlobSet,
    empty: bool,
}

impl ExcludeSet {
    /// Compile a list of patterns. Blank patterns are ignored.
    pub fn new(patterns: &[String]) -> crate::Result<Self> {
        let mut any = GlobSetBuilder::new();
        let mut dirs = GlobSetBuilder::new();
        let mut empty = true;

        for raw in patterns {
            let pattern = raw.trim();
            if pattern.is_empty() {
                continue;
            }
            empty = false;

            let pattern = pattern.trim_start_matches("./");
            if let Some(dir) = pattern.strip_suffix('/') {
                let dir = dir.trim_end_matches('/');
                dirs.add(compile(dir, raw)?);
                any.add(compile(&format!("{dir}/**"), raw)?);
            } else {
                any.add(compile(pattern, raw)?);
            }
        }

        Ok(Self {
            any: build(any)?,
            dirs: build(dirs)?,
            empty,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// `rel_path` is relative to the inclusion root the entry was found under
    pub fn is_excluded(&self, rel_path: &Path, is_dir: bool) -> bool {
        if self.empty || rel_path.as_os_str().is_empty() {
            return false;
        }

        let name = rel_path.file_name().map(Path::new);
        let matches = |set: &GlobSet| set.is_match(rel_path) || name.is_some_and(|n| set.is_match(n));

        matches(&self.any) || (is_dir && matches(&self.dirs))
    }
}

fn compile(pattern: &str, raw: &str) -> crate::Result<Glob> {
    Glob::new(pattern).map_err(|e| EngineError::Selection(format!("invalid exclude pattern '{raw}': {e}")))
}

fn build(builder: GlobSetBuilder) -> crate::Result<GlobSet> {
    builder
        .build()
        .map_err(|e| EngineError::Selection(format!("invalid exclude patterns: {e}")))
}
