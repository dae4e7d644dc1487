//! Tar writer and reader stages. Both run on blocking threads.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bridge::{ChannelReader, ChannelWriter};
use super::StageContext;
use crate::fs::{EntryKind, SelectedEntry, SelectionResult};
use crate::policy::StageName;
use crate::utils::errors::EngineError;
use crate::ws::JobEvent;

/// Write `selection` as a tar stream, in selection order.
///
/// Headers carry mode, owner ids and mtime but no atime/ctime, so unchanged
/// content produces identical bytes.
pub fn write_archive(selection: &SelectionResult, out: ChannelWriter, ctx: &StageContext) -> crate::Result<()> {
    let mut builder = Builder::new(out);
    builder.mode(HeaderMode::Complete);
    builder.follow_symlinks(false);

    for entry in &selection.entries {
        if ctx.cancel().is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match entry.kind {
            EntryKind::Directory => append_directory(&mut builder, entry, ctx)?,
            EntryKind::Symlink => append_symlink(&mut builder, entry, ctx)?,
            EntryKind::File => append_file(&mut builder, entry, ctx)?,
        }
    }

    let mut out = builder
        .into_inner()
        .map_err(|e| output_error(e, StageName::Archive, ctx))?;
    out.flush().map_err(|e| output_error(e, StageName::Archive, ctx))?;
    Ok(())
}

fn append_directory(builder: &mut Builder<ChannelWriter>, entry: &SelectedEntry, ctx: &StageContext) -> crate::Result<()> {
    let meta = match std::fs::symlink_metadata(&entry.path) {
        Ok(meta) => meta,
        Err(e) => return skip(entry, e, ctx),
    };

    let mut header = entry_header(&meta);
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);

    builder
        .append_data(&mut header, &entry.archive_path, io::empty())
        .map_err(|e| output_error(e, StageName::Archive, ctx))
}

fn append_symlink(builder: &mut Builder<ChannelWriter>, entry: &SelectedEntry, ctx: &StageContext) -> crate::Result<()> {
    let (meta, target) = match std::fs::symlink_metadata(&entry.path).and_then(|m| Ok((m, std::fs::read_link(&entry.path)?))) {
        Ok(found) => found,
        Err(e) => return skip(entry, e, ctx),
    };

    let mut header = entry_header(&meta);
    header.set_entry_type(EntryType::Symlink);
    header.set_size(0);

    builder
        .append_link(&mut header, &entry.archive_path, &target)
        .map_err(|e| output_error(e, StageName::Archive, ctx))
}

fn append_file(builder: &mut Builder<ChannelWriter>, entry: &SelectedEntry, ctx: &StageContext) -> crate::Result<()> {
    let display = entry.archive_path.to_string_lossy().to_string();

    // Open first so an unreadable file is skipped before its header is written
    let (file, meta) = match File::open(&entry.path).and_then(|f| Ok((f.metadata()?, f))) {
        Ok((meta, file)) => (file, meta),
        Err(e) => return skip(entry, e, ctx),
    };
    let size = meta.len();

    ctx.meter.set_current_file(display.clone());
    if ctx.live_files {
        ctx.hub.publish(JobEvent::FileStarted {
            job_id: ctx.job_id.clone(),
            path: display.clone(),
            size,
        });
    }

    let mut header = entry_header(&meta);
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);

    let mut reader = SourceReader::new(file, size, ctx);
    builder
        .append_data(&mut header, &entry.archive_path, &mut reader)
        .map_err(|e| output_error(e, StageName::Archive, ctx))?;
    ctx.meter.file_done();

    if let Some(err) = reader.failed.take() {
        // The header promised `size` bytes; the remainder was zero-filled
        return skip(entry, err, ctx);
    }

    if ctx.live_files {
        ctx.hub.publish(JobEvent::FileCompleted {
            job_id: ctx.job_id.clone(),
            path: display,
            size,
        });
    }
    Ok(())
}

/// GNU header from `meta` without access or change times, so unchanged
/// content yields identical bytes
/// Bundle finished archives into one plain tar stream, each entry named
/// after its file. Split downloads hand their per-subdirectory archives to
/// the client this way.
pub fn write_bundle(artifacts: &[PathBuf], out: ChannelWriter, cancel: &CancellationToken) -> crate::Result<()> {
    let bundle_error = |err: io::Error| {
        if cancel.is_cancelled() || err.kind() == io::ErrorKind::BrokenPipe {
            EngineError::Cancelled
        } else {
            EngineError::fatal(StageName::Sink, err.to_string())
        }
    };

    let mut builder = Builder::new(out);
    for artifact in artifacts {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(name) = artifact.file_name() else {
            return Err(EngineError::fatal(
                StageName::Sink,
                format!("{} has no file name", artifact.display()),
            ));
        };
        let mut file = File::open(artifact).map_err(|e| EngineError::fatal(StageName::Sink, e.to_string()))?;
        let meta = file
            .metadata()
            .map_err(|e| EngineError::fatal(StageName::Sink, e.to_string()))?;
        let mut header = entry_header(&meta);
        builder.append_data(&mut header, name, &mut file).map_err(bundle_error)?;
        debug!("Bundled {}", artifact.display());
    }

    let mut out = builder.into_inner().map_err(bundle_error)?;
    out.flush().map_err(bundle_error)
}

fn entry_header(meta: &std::fs::Metadata) -> Header {
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(meta, HeaderMode::Complete);
    if let Some(gnu) = header.as_gnu_mut() {
        gnu.set_atime(0);
        gnu.set_ctime(0);
    }
    header
}

/// Route a per-entry error through the policy and report the skip.
fn skip(entry: &SelectedEntry, err: io::Error, ctx: &StageContext) -> crate::Result<()> {
    let message = err.to_string();
    ctx.controller.on_entry_error(&entry.path, StageName::Archive, err)?;
    if ctx.live_files {
        ctx.hub.publish(JobEvent::FileFailed {
            job_id: ctx.job_id.clone(),
            path: entry.archive_path.to_string_lossy().to_string(),
            stage: StageName::Archive,
            message,
        });
    }
    Ok(())
}

/// Errors raised while writing to or reading from a stage channel
fn output_error(err: io::Error, stage: StageName, ctx: &StageContext) -> EngineError {
    if ctx.cancel().is_cancelled() || err.kind() == io::ErrorKind::BrokenPipe {
        EngineError::Cancelled
    } else {
        EngineError::fatal(stage, err.to_string())
    }
}

/// Reads exactly `remaining` bytes of a source file. A read error, or the
/// file shrinking, ends the real data; the rest is zero padding so the tar
/// stream stays well-formed.
struct SourceReader<'a> {
    file: File,
    remaining: u64,
    failed: Option<io::Error>,
    exhausted: bool,
    ctx: &'a StageContext,
}

impl<'a> SourceReader<'a> {
    fn new(file: File, size: u64, ctx: &'a StageContext) -> Self {
        Self {
            file,
            remaining: size,
            failed: None,
            exhausted: false,
            ctx,
        }
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        if self.ctx.cancel().is_cancelled() {
            return Err(io::Error::other("pipeline cancelled"));
        }

        let want = buf.len().min(self.remaining as usize);
        let n = if self.exhausted {
            buf[..want].fill(0);
            want
        } else {
            match self.file.read(&mut buf[..want]) {
                Ok(0) => {
                    self.exhausted = true;
                    buf[..want].fill(0);
                    want
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
                Err(e) => {
                    self.failed = Some(e);
                    self.exhausted = true;
                    buf[..want].fill(0);
                    want
                }
            }
        };

        self.remaining -= n as u64;
        self.ctx.meter.add_bytes(n as u64);
        Ok(n)
    }
}

/// Unpack a tar stream under `dest`. Entries that would land outside `dest`
/// are per-entry failures.
pub fn read_archive(input: ChannelReader, dest: &Path, ctx: &StageContext) -> crate::Result<()> {
    std::fs::create_dir_all(dest)
        .map_err(|e| EngineError::fatal(StageName::Unarchive, format!("cannot create {}: {}", dest.display(), e)))?;

    let mut archive = Archive::new(input);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    {
        let entries = archive
            .entries()
            .map_err(|e| output_error(e, StageName::Unarchive, ctx))?;

        for entry in entries {
            if ctx.cancel().is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            // A header that cannot be parsed means the stream is corrupt
            let mut entry = entry.map_err(|e| output_error(e, StageName::Unarchive, ctx))?;
            let rel: PathBuf = entry
                .path()
                .map(|p| p.into_owned())
                .unwrap_or_else(|_| PathBuf::from("<invalid path>"));
            let display = rel.to_string_lossy().to_string();
            let size = entry.size();
            let is_file = entry.header().entry_type().is_file();

            if is_file {
                ctx.meter.set_current_file(display.clone());
                if ctx.live_files {
                    ctx.hub.publish(JobEvent::FileStarted {
                        job_id: ctx.job_id.clone(),
                        path: display.clone(),
                        size,
                    });
                }
            }

            let failure = match entry.unpack_in(dest) {
                Ok(true) => None,
                Ok(false) => Some(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "entry would be written outside the destination",
                )),
                Err(e) => {
                    if ctx.cancel().is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    Some(e)
                }
            };

            match failure {
                None => {
                    if is_file {
                        ctx.meter.file_done();
                        if ctx.live_files {
                            ctx.hub.publish(JobEvent::FileCompleted {
                                job_id: ctx.job_id.clone(),
                                path: display,
                                size,
                            });
                        }
                    }
                }
                Some(err) => {
                    let message = err.to_string();
                    ctx.controller
                        .on_entry_error(&dest.join(&rel), StageName::Unarchive, err)?;
                    if ctx.live_files {
                        ctx.hub.publish(JobEvent::FileFailed {
                            job_id: ctx.job_id.clone(),
                            path: display,
                            stage: StageName::Unarchive,
                            message,
                        });
                    }
                }
            }
        }
    }

    // Consume trailing padding so the upstream stage can finish
    let mut rest = archive.into_inner();
    let trailing = io::copy(&mut rest, &mut io::sink()).map_err(|e| output_error(e, StageName::Unarchive, ctx))?;
    debug!(job_id = %ctx.job_id, "Archive unpacked ({} trailing bytes)", trailing);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ToolsConfig};
    use crate::policy::{ErrorPolicy, ErrorPolicyController};
    use crate::transfer::progress::ProgressMeter;
    use crate::ws::EventHub;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn context(policy: ErrorPolicy, live_files: bool) -> Arc<StageContext> {
        Arc::new(StageContext {
            job_id: "archive-test".to_string(),
            controller: Arc::new(ErrorPolicyController::new(policy, CancellationToken::new())),
            meter: Arc::new(ProgressMeter::new()),
            hub: EventHub::new(64),
            live_files,
            engine: EngineConfig::default(),
            tools: ToolsConfig::default(),
            secret: None,
            subject: PathBuf::from("/tmp/out.tar"),
        })
    }

    fn entry(path: PathBuf, archive_path: &str, kind: EntryKind) -> SelectedEntry {
        let size = if kind == EntryKind::File {
            std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        SelectedEntry {
            path,
            archive_path: PathBuf::from(archive_path),
            size,
            kind,
        }
    }

    async fn archive_bytes(selection: SelectionResult, ctx: Arc<StageContext>) -> crate::Result<Vec<u8>> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        let writer = ChannelWriter::new(tx, 1024, ctx.cancel().clone());
        let task = tokio::task::spawn_blocking(move || write_archive(&selection, writer, &ctx));

        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        task.await.unwrap()?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped_under_ignore() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let selection = SelectionResult {
            base: dir.path().to_path_buf(),
            entries: vec![
                entry(dir.path().join("gone.txt"), "gone.txt", EntryKind::File),
                entry(dir.path().join("keep.txt"), "keep.txt", EntryKind::File),
            ],
            total_bytes: 4,
        };

        let ctx = context(ErrorPolicy::Ignore, true);
        let mut events = ctx.hub.subscribe_all();
        let bytes = archive_bytes(selection, ctx.clone()).await.unwrap();

        let mut archive = Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["keep.txt"]);

        let report = ctx.controller.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report.records()[0].path, dir.path().join("gone.txt"));

        assert!(matches!(events.recv().await.unwrap(), JobEvent::FileFailed { .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::FileStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::FileCompleted { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_aborts_under_abort() {
        let dir = TempDir::new().unwrap();
        let selection = SelectionResult {
            base: dir.path().to_path_buf(),
            entries: vec![entry(dir.path().join("gone.txt"), "gone.txt", EntryKind::File)],
            total_bytes: 0,
        };

        let ctx = context(ErrorPolicy::Abort, false);
        let err = archive_bytes(selection, ctx.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::PerEntryIo { .. }));
        assert!(ctx.cancel().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_stored_as_link() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("target.txt"), b"t").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

        let selection = SelectionResult {
            base: dir.path().to_path_buf(),
            entries: vec![entry(dir.path().join("link"), "link", EntryKind::Symlink)],
            total_bytes: 0,
        };

        let bytes = archive_bytes(selection, context(ErrorPolicy::Ignore, false)).await.unwrap();
        let mut archive = Archive::new(bytes.as_slice());
        let link = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(link.header().entry_type(), EntryType::Symlink);
        assert_eq!(link.link_name().unwrap().unwrap().to_str(), Some("target.txt"));
    }

    #[tokio::test]
    async fn test_entry_escaping_destination_is_rejected() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dest");

        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        // Bypass set_path validation to forge a traversal entry
        let name = b"../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        let mut ok = Header::new_gnu();
        ok.set_size(2);
        ok.set_mode(0o644);
        ok.set_entry_type(EntryType::Regular);
        builder.append_data(&mut ok, "ok.txt", &b"ok"[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tx.send(Bytes::from(tar_bytes)).await.unwrap();
        drop(tx);

        let ctx = context(ErrorPolicy::Ignore, false);
        let task_ctx = ctx.clone();
        let task_dest = dest.clone();
        tokio::task::spawn_blocking(move || read_archive(ChannelReader::new(rx), &task_dest, &task_ctx))
            .await
            .unwrap()
            .unwrap();

        assert!(!dir.path().join("evil.txt").exists());
        assert_eq!(std::fs::read(dest.join("ok.txt")).unwrap(), b"ok");
        assert_eq!(ctx.controller.failure_count(), 1);
        assert_eq!(ctx.meter.files(), 1);
    }

    #[tokio::test]
    async fn test_bundle_names_entries_after_their_files() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("media_music.tar.zst");
        let video = dir.path().join("media_video.tar.zst");
        std::fs::write(&music, b"music archive").unwrap();
        std::fs::write(&video, b"video").unwrap();

        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        let cancel = CancellationToken::new();
        let writer = ChannelWriter::new(tx, 512, cancel.clone());
        let artifacts = vec![music, video];
        let task = tokio::task::spawn_blocking(move || write_bundle(&artifacts, writer, &cancel));

        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        task.await.unwrap().unwrap();

        let mut archive = Archive::new(bytes.as_slice());
        let entries: Vec<(String, Vec<u8>)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().to_string();
                let mut body = Vec::new();
                e.read_to_end(&mut body).unwrap();
                (name, body)
            })
            .collect();

        assert_eq!(
            entries,
            vec![
                ("media_music.tar.zst".to_string(), b"music archive".to_vec()),
                ("media_video.tar.zst".to_string(), b"video".to_vec()),
            ]
        );
    }
}
