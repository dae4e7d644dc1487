//! Path selection: inclusion paths + exclude patterns → concrete entry list.
//!
//! Symbolic links are recorded as links and never followed, so a selection
//! cannot escape its inclusion roots or loop.

use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::fs::patterns::ExcludeSet;
use crate::policy::{ErrorPolicyController, StageName};
use crate::utils::errors::EngineError;

/// Kind of a selected entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A file, directory or link selected for backup
#[derive(Debug, Clone)]
pub struct SelectedEntry {
    /// Absolute path on disk
    pub path: PathBuf,

    /// Path inside the archive, relative to the selection base
    pub archive_path: PathBuf,

    /// File size in bytes (0 for directories and links)
    pub size: u64,

    pub kind: EntryKind,
}

/// Resolved selection, ordered by archive path
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    /// Directory every archive path is relative to
    pub base: PathBuf,

    pub entries: Vec<SelectedEntry>,

    /// Sum of regular file sizes. Advisory only.
    pub total_bytes: u64,
}

impl SelectionResult {
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.kind == EntryKind::File).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One independent unit of a split-mode backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitUnit {
    /// Name of the subdirectory
    pub name: String,

    /// Absolute path of the subdirectory
    pub root: PathBuf,
}

/// Make paths absolute, drop duplicates and paths nested under another
/// selected path. The result is sorted.
pub fn prune_redundant_paths(paths: &[PathBuf]) -> crate::Result<Vec<PathBuf>> {
    let mut absolute = Vec::with_capacity(paths.len());
    for path in paths {
        if path.as_os_str().is_empty() {
            continue;
        }
        absolute.push(normalize(&std::path::absolute(path)?));
    }
    absolute.sort();
    absolute.dedup();

    let mut pruned: Vec<PathBuf> = Vec::with_capacity(absolute.len());
    for path in absolute {
        if !pruned.iter().any(|parent| path.starts_with(parent)) {
            pruned.push(path);
        }
    }
    Ok(pruned)
}

/// Directory all archive paths are made relative to: the parent of a single
/// root, or the deepest common ancestor of several.
pub fn common_base(roots: &[PathBuf]) -> PathBuf {
    match roots {
        [] => PathBuf::new(),
        [single] => single
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| single.clone()),
        [first, rest @ ..] => {
            let mut base = first.clone();
            for root in rest {
                while !root.starts_with(&base) {
                    if !base.pop() {
                        break;
                    }
                }
            }
            base
        }
    }
}

/// Resolve inclusion paths and exclude patterns into a selection.
///
/// Per-entry stat/read errors go through `controller`: skipped under
/// `ignore`, returned immediately under `abort`.
pub fn select(
    paths: &[PathBuf],
    excludes: &ExcludeSet,
    controller: &ErrorPolicyController,
) -> crate::Result<SelectionResult> {
    let roots = prune_redundant_paths(paths)?;
    if roots.is_empty() {
        return Err(EngineError::Selection("no source paths selected".into()));
    }
    if roots.len() < paths.len() {
        info!("Pruned source list to: {:?}", roots);
    }

    let base = common_base(&roots);
    let cancel = controller.cancel_token();
    let mut entries = Vec::new();
    let mut total_bytes = 0u64;

    for root in &roots {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let root_meta = match std::fs::symlink_metadata(root) {
            Ok(meta) => meta,
            Err(e) => {
                controller.on_entry_error(root, StageName::Selection, e)?;
                continue;
            }
        };

        let root_name = root.file_name().map(Path::new);
        if root_name.is_some_and(|name| excludes.is_excluded(name, root_meta.is_dir())) {
            debug!("Excluded source {}", root.display());
            continue;
        }

        if !root_meta.is_dir() {
            if let Some(entry) = classify(root, &base, &root_meta) {
                total_bytes += entry.size;
                entries.push(entry);
            }
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_excluded(e, root, excludes));

        for item in walker {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    let io_err = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
                    controller.on_entry_error(&path, StageName::Selection, io_err)?;
                    continue;
                }
            };

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    let io_err = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                    controller.on_entry_error(entry.path(), StageName::Selection, io_err)?;
                    continue;
                }
            };

            if let Some(selected) = classify(entry.path(), &base, &meta) {
                total_bytes += selected.size;
                entries.push(selected);
            }
        }
    }

    entries.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
    entries.dedup_by(|a, b| a.archive_path == b.archive_path);

    debug!(
        "Selected {} entries ({} bytes) under {}",
        entries.len(),
        total_bytes,
        base.display()
    );

    Ok(SelectionResult {
        base,
        entries,
        total_bytes,
    })
}

/// List the split units of a split-mode job: the immediate subdirectories of
/// its single inclusion path, sorted by name.
pub fn split_units(paths: &[PathBuf]) -> crate::Result<Vec<SplitUnit>> {
    let roots = prune_redundant_paths(paths)?;
    let parent = match roots.as_slice() {
        [parent] => parent,
        _ => {
            return Err(EngineError::Selection(format!(
                "split mode needs exactly one source directory, got {}",
                roots.len()
            )))
        }
    };

    let meta = std::fs::metadata(parent)
        .map_err(|e| EngineError::Selection(format!("cannot stat {}: {}", parent.display(), e)))?;
    if !meta.is_dir() {
        return Err(EngineError::Selection(format!(
            "split mode source {} is not a directory",
            parent.display()
        )));
    }

    let read_dir = std::fs::read_dir(parent)
        .map_err(|e| EngineError::Selection(format!("cannot list {}: {}", parent.display(), e)))?;

    let mut units = Vec::new();
    for entry in read_dir {
        let entry = entry
            .map_err(|e| EngineError::Selection(format!("cannot list {}: {}", parent.display(), e)))?;
        let file_type = entry
            .file_type()
            .map_err(|e| EngineError::Selection(format!("cannot stat {}: {}", entry.path().display(), e)))?;
        if file_type.is_dir() {
            units.push(SplitUnit {
                name: entry.file_name().to_string_lossy().to_string(),
                root: entry.path(),
            });
        }
    }
    units.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(units)
}

fn is_excluded(entry: &DirEntry, root: &Path, excludes: &ExcludeSet) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
    excludes.is_excluded(rel, entry.file_type().is_dir())
}

/// Build a selected entry, or `None` for special files and the filesystem
/// root itself.
fn classify(path: &Path, base: &Path, meta: &std::fs::Metadata) -> Option<SelectedEntry> {
    let archive_path = path.strip_prefix(base).unwrap_or(path).to_path_buf();
    if archive_path.as_os_str().is_empty() {
        return None;
    }

    let file_type = meta.file_type();
    let (kind, size) = if file_type.is_symlink() {
        (EntryKind::Symlink, 0)
    } else if file_type.is_dir() {
        (EntryKind::Directory, 0)
    } else if file_type.is_file() {
        (EntryKind::File, meta.len())
    } else {
        debug!("Skipping special file {}", path.display());
        return None;
    };

    Some(SelectedEntry {
        path: path.to_path_buf(),
        archive_path,
        size,
        kind,
    })
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
