//! Streaming backup/restore pipeline.
//!
//! A pipeline is a fixed chain of stages connected by bounded channels of
//! `Bytes` chunks:
//!
//! ```text
//! backup:  selection → archive → compress → [encrypt] → file | stream
//! restore: archive file → [decrypt] → decompress → unarchive → directory
//! ```
//!
//! Every stage observes the unit's cancellation token and reports its errors
//! to the unit's [`ErrorPolicyController`]. Backups write to `<artifact>.partial`,
//! renamed only when every stage succeeded.

pub mod archive;
pub mod bridge;
pub mod process;
pub mod sink;
pub mod transform;

use bytes::Bytes;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{EngineConfig, ToolsConfig};
use crate::fs::SelectionResult;
use crate::job::{Encryption, Secret};
use crate::policy::{ErrorPolicyController, StageName};
use crate::transfer::progress::ProgressMeter;
use crate::utils::errors::EngineError;
use crate::ws::EventHub;
use bridge::{ChannelReader, ChannelWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Age,
    Gpg,
}

impl Cipher {
    pub fn from_encryption(encryption: Encryption) -> Option<Self> {
        match encryption {
            Encryption::None => None,
            Encryption::Age => Some(Cipher::Age),
            Encryption::Gpg => Some(Cipher::Gpg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Archive,
    Compress,
    Encrypt(Cipher),
    Decrypt(Cipher),
    Decompress,
    Unarchive,
}

impl StageKind {
    pub fn name(&self) -> StageName {
        match self {
            StageKind::Archive => StageName::Archive,
            StageKind::Compress => StageName::Compress,
            StageKind::Encrypt(_) => StageName::Encrypt,
            StageKind::Decrypt(_) => StageName::Decrypt,
            StageKind::Decompress => StageName::Decompress,
            StageKind::Unarchive => StageName::Unarchive,
        }
    }

    pub fn backup_chain(encryption: Encryption) -> Vec<StageKind> {
        let mut chain = vec![StageKind::Archive, StageKind::Compress];
        if let Some(cipher) = Cipher::from_encryption(encryption) {
            chain.push(StageKind::Encrypt(cipher));
        }
        chain
    }

    pub fn restore_chain(encryption: Encryption) -> Vec<StageKind> {
        let mut chain = Vec::with_capacity(3);
        if let Some(cipher) = Cipher::from_encryption(encryption) {
            chain.push(StageKind::Decrypt(cipher));
        }
        chain.push(StageKind::Decompress);
        chain.push(StageKind::Unarchive);
        chain
    }
}

pub enum PipelineSource {
    /// Entries to archive
    Selection(Arc<SelectionResult>),
    /// Archive file to restore from
    Archive(PathBuf),
}

pub enum PipelineSink {
    /// Backup artifact on disk
    File(PathBuf),
    /// Backup bytes handed to the caller
    Stream(mpsc::Sender<Bytes>),
    /// Restore root
    Directory(PathBuf),
}

/// Everything a stage needs besides its input and output
pub struct StageContext {
    pub job_id: String,
    pub controller: Arc<ErrorPolicyController>,
    pub meter: Arc<ProgressMeter>,
    pub hub: EventHub,
    /// Emit per-file events
    pub live_files: bool,
    pub engine: EngineConfig,
    pub tools: ToolsConfig,
    pub secret: Option<Secret>,
    /// Path named in stage failure records: the artifact or the archive
    pub subject: PathBuf,
}

impl StageContext {
    pub fn cancel(&self) -> &CancellationToken {
        self.controller.cancel_token()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Artifact written, or the restore root
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Done,
    /// Cancelled, or its peer went away
    Stopped,
    Failed,
}

pub struct Pipeline {
    stages: Vec<StageKind>,
    source: PipelineSource,
    sink: PipelineSink,
    ctx: Arc<StageContext>,
}

impl Pipeline {
    /// Compose a pipeline. The chain is fixed from here on.
    pub fn new(
        stages: Vec<StageKind>,
        source: PipelineSource,
        sink: PipelineSink,
        ctx: Arc<StageContext>,
    ) -> crate::Result<Self> {
        validate_chain(&stages, &source, &sink)?;
        Ok(Self {
            stages,
            source,
            sink,
            ctx,
        })
    }

    /// Drive bytes through every stage until the sink is done, a stage
    /// aborts the unit, or the unit is cancelled.
    pub async fn run(self) -> crate::Result<PipelineSummary> {
        let Pipeline {
            stages,
            source,
            sink,
            ctx,
        } = self;
        let capacity = ctx.engine.channel_capacity.max(1);
        let chunk_size = ctx.engine.chunk_size.max(1);

        debug!(job_id = %ctx.job_id, "Starting pipeline {:?}", stages);

        let mut tasks: Vec<(StageName, JoinHandle<StageOutcome>)> = Vec::with_capacity(stages.len() + 2);
        let mut selection = None;
        let mut upstream: Option<mpsc::Receiver<Bytes>> = None;

        match source {
            PipelineSource::Selection(sel) => selection = Some(sel),
            PipelineSource::Archive(path) => {
                let (tx, rx) = mpsc::channel(capacity);
                let guard = tx.clone();
                let stage_ctx = Arc::clone(&ctx);
                let handle = spawn_stage(StageName::Source, &ctx, guard, async move {
                    sink::read_file(&path, tx, &stage_ctx).await
                });
                tasks.push((StageName::Source, handle));
                upstream = Some(rx);
            }
        }

        let (restore_root, artifact) = match &sink {
            PipelineSink::Directory(dir) => (Some(dir.clone()), Some(dir.clone())),
            PipelineSink::File(path) => (None, Some(path.clone())),
            PipelineSink::Stream(_) => (None, None),
        };

        for kind in stages {
            let name = kind.name();
            match kind {
                StageKind::Archive => {
                    let selection = selection.take().ok_or_else(malformed)?;
                    let (tx, rx) = mpsc::channel(capacity);
                    let writer = ChannelWriter::new(tx.clone(), chunk_size, ctx.cancel().clone());
                    let stage_ctx = Arc::clone(&ctx);
                    let handle = spawn_blocking_stage(name, &ctx, tx, move || {
                        archive::write_archive(&selection, writer, &stage_ctx)
                    });
                    tasks.push((name, handle));
                    upstream = Some(rx);
                }
                StageKind::Unarchive => {
                    let input = upstream.take().ok_or_else(malformed)?;
                    let dest = restore_root.clone().ok_or_else(malformed)?;
                    let stage_ctx = Arc::clone(&ctx);
                    let handle = spawn_blocking_stage(name, &ctx, (), move || {
                        archive::read_archive(ChannelReader::new(input), &dest, &stage_ctx)
                    });
                    tasks.push((name, handle));
                }
                transform_kind => {
                    let input = upstream.take().ok_or_else(malformed)?;
                    let (tx, rx) = mpsc::channel(capacity);
                    let guard = tx.clone();
                    let stage_ctx = Arc::clone(&ctx);
                    let handle = spawn_stage(name, &ctx, guard, async move {
                        transform::run(transform_kind, input, tx, &stage_ctx).await
                    });
                    tasks.push((name, handle));
                    upstream = Some(rx);
                }
            }
        }

        let partial = match (sink, upstream) {
            (PipelineSink::File(path), Some(input)) => {
                let partial = sink::partial_path(&path);
                let target = partial.clone();
                let stage_ctx = Arc::clone(&ctx);
                let handle = spawn_stage(StageName::Sink, &ctx, (), async move {
                    sink::write_file(input, &target, &stage_ctx).await
                });
                tasks.push((StageName::Sink, handle));
                Some(partial)
            }
            (PipelineSink::Stream(out), Some(input)) => {
                let stage_ctx = Arc::clone(&ctx);
                let handle = spawn_stage(StageName::Sink, &ctx, (), async move {
                    sink::forward(input, out, &stage_ctx).await
                });
                tasks.push((StageName::Sink, handle));
                None
            }
            (PipelineSink::Directory(_), None) => None,
            _ => return Err(malformed()),
        };

        let mut stopped = Vec::new();
        for (name, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    ctx.controller
                        .on_stage_error(&ctx.subject, EngineError::fatal(name, format!("stage task failed: {}", e)));
                    StageOutcome::Failed
                }
            };
            if outcome == StageOutcome::Stopped {
                stopped.push(name);
            }
        }

        let result = if let Some(cause) = ctx.controller.take_cause() {
            Err(cause)
        } else if ctx.cancel().is_cancelled() {
            Err(EngineError::Cancelled)
        } else if let Some(stage) = stopped.first() {
            Err(EngineError::fatal(*stage, "stage disconnected"))
        } else {
            Ok(())
        };

        match (result, partial, artifact) {
            (Ok(()), Some(partial), Some(artifact)) => {
                sink::finalize(&partial, &artifact).await?;
                info!(job_id = %ctx.job_id, "Wrote {}", artifact.display());
                Ok(PipelineSummary {
                    artifact: Some(artifact),
                })
            }
            (Ok(()), _, artifact) => Ok(PipelineSummary { artifact }),
            (Err(e), partial, _) => {
                if let Some(partial) = partial {
                    sink::discard(&partial).await;
                }
                Err(e)
            }
        }
    }
}

fn malformed() -> EngineError {
    EngineError::InvalidSpec("malformed pipeline".into())
}

fn validate_chain(stages: &[StageKind], source: &PipelineSource, sink: &PipelineSink) -> crate::Result<()> {
    use StageKind::*;

    let valid = match (source, sink) {
        (PipelineSource::Selection(_), PipelineSink::File(_) | PipelineSink::Stream(_)) => {
            matches!(stages, [Archive, Compress] | [Archive, Compress, Encrypt(_)])
        }
        (PipelineSource::Archive(_), PipelineSink::Directory(_)) => {
            matches!(stages, [Decompress, Unarchive] | [Decrypt(_), Decompress, Unarchive])
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidSpec(format!("unsupported stage chain {:?}", stages)))
    }
}

/// Route a finished stage's result through the policy controller.
fn settle(name: StageName, ctx: &StageContext, result: crate::Result<()>) -> StageOutcome {
    match result {
        Ok(()) => {
            debug!(job_id = %ctx.job_id, stage = %name, "Stage finished");
            StageOutcome::Done
        }
        Err(EngineError::Cancelled) => {
            debug!(job_id = %ctx.job_id, stage = %name, "Stage stopped");
            StageOutcome::Stopped
        }
        Err(e) => {
            ctx.controller.on_stage_error(&ctx.subject, e);
            StageOutcome::Failed
        }
    }
}

/// Run an async stage. `guard` keeps the stage's output channel open until
/// its result has been reported, so downstream never mistakes a failure for
/// end of stream.
fn spawn_stage<F, G>(name: StageName, ctx: &Arc<StageContext>, guard: G, fut: F) -> JoinHandle<StageOutcome>
where
    F: Future<Output = crate::Result<()>> + Send + 'static,
    G: Send + 'static,
{
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let result = fut.await;
        let outcome = settle(name, &ctx, result);
        drop(guard);
        outcome
    })
}

fn spawn_blocking_stage<F, G>(name: StageName, ctx: &Arc<StageContext>, guard: G, f: F) -> JoinHandle<StageOutcome>
where
    F: FnOnce() -> crate::Result<()> + Send + 'static,
    G: Send + 'static,
{
    let ctx = Arc::clone(ctx);
    tokio::task::spawn_blocking(move || {
        let result = f();
        let outcome = settle(name, &ctx, result);
        drop(guard);
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{select, ExcludeSet};
    use crate::policy::ErrorPolicy;
    use std::io::Read;
    use tempfile::TempDir;

    fn context(dir: &TempDir, policy: ErrorPolicy) -> Arc<StageContext> {
        let controller = ErrorPolicyController::new(policy, CancellationToken::new());
        Arc::new(StageContext {
            job_id: "test-job".to_string(),
            controller: Arc::new(controller),
            meter: Arc::new(ProgressMeter::new()),
            hub: EventHub::new(64),
            live_files: false,
            engine: EngineConfig::default(),
            tools: ToolsConfig::default(),
            secret: None,
            subject: dir.path().join("out.tar.zst"),
        })
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("nested/b.txt"), vec![7u8; 200_000]).unwrap();
        dir
    }

    #[test]
    fn test_chain_validation() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, ErrorPolicy::Ignore);
        let selection = Arc::new(SelectionResult::default());

        let ok = Pipeline::new(
            StageKind::backup_chain(Encryption::Gpg),
            PipelineSource::Selection(selection.clone()),
            PipelineSink::File(dir.path().join("x.tar.zst.gpg")),
            ctx.clone(),
        );
        assert!(ok.is_ok());

        let wrong_order = Pipeline::new(
            vec![StageKind::Compress, StageKind::Archive],
            PipelineSource::Selection(selection.clone()),
            PipelineSink::File(dir.path().join("x.tar.zst")),
            ctx.clone(),
        );
        assert!(wrong_order.is_err());

        let wrong_sink = Pipeline::new(
            StageKind::restore_chain(Encryption::None),
            PipelineSource::Selection(selection),
            PipelineSink::Directory(dir.path().to_path_buf()),
            ctx,
        );
        assert!(wrong_sink.is_err());
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let dir = sample_tree();
        let ctx = context(&dir, ErrorPolicy::Ignore);
        let excludes = ExcludeSet::new(&[]).unwrap();
        let selection = select(&[dir.path().join("src")], &excludes, &ctx.controller).unwrap();
        let total = selection.total_bytes;

        let artifact = dir.path().join("out.tar.zst");
        let summary = Pipeline::new(
            StageKind::backup_chain(Encryption::None),
            PipelineSource::Selection(Arc::new(selection)),
            PipelineSink::File(artifact.clone()),
            ctx.clone(),
        )
        .unwrap()
        .run()
        .await
        .unwrap();

        assert_eq!(summary.artifact.as_deref(), Some(artifact.as_path()));
        assert!(artifact.exists());
        assert!(!sink::partial_path(&artifact).exists());
        assert_eq!(ctx.meter.bytes(), total);
        assert_eq!(ctx.meter.files(), 2);

        let restore_dir = dir.path().join("restored");
        let restore_ctx = context(&dir, ErrorPolicy::Ignore);
        Pipeline::new(
            StageKind::restore_chain(Encryption::None),
            PipelineSource::Archive(artifact.clone()),
            PipelineSink::Directory(restore_dir.clone()),
            restore_ctx.clone(),
        )
        .unwrap()
        .run()
        .await
        .unwrap();

        assert_eq!(std::fs::read(restore_dir.join("src/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            std::fs::read(restore_dir.join("src/nested/b.txt")).unwrap(),
            vec![7u8; 200_000]
        );
        assert_eq!(
            restore_ctx.meter.bytes(),
            std::fs::metadata(&artifact).unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_stream_sink_delivers_archive() {
        let dir = sample_tree();
        let ctx = context(&dir, ErrorPolicy::Ignore);
        let excludes = ExcludeSet::new(&[]).unwrap();
        let selection = select(&[dir.path().join("src")], &excludes, &ctx.controller).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });

        Pipeline::new(
            StageKind::backup_chain(Encryption::None),
            PipelineSource::Selection(Arc::new(selection)),
            PipelineSink::Stream(tx),
            ctx,
        )
        .unwrap()
        .run()
        .await
        .unwrap();

        let compressed = collector.await.unwrap();
        let tar_bytes = zstd::decode_all(compressed.as_slice()).unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if name == "src/a.txt" {
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                assert_eq!(body, "alpha");
            }
            names.push(name);
        }
        assert_eq!(names, vec!["src", "src/a.txt", "src/nested", "src/nested/b.txt"]);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_fatal() {
        let dir = sample_tree();
        let ctx = context(&dir, ErrorPolicy::Ignore);
        let excludes = ExcludeSet::new(&[]).unwrap();
        let selection = select(&[dir.path().join("src")], &excludes, &ctx.controller).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = Pipeline::new(
            StageKind::backup_chain(Encryption::None),
            PipelineSource::Selection(Arc::new(selection)),
            PipelineSink::Stream(tx),
            ctx,
        )
        .unwrap()
        .run()
        .await
        .unwrap_err();

        assert!(err.is_fatal(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_cancelled_backup_leaves_no_artifact() {
        let dir = sample_tree();
        let ctx = context(&dir, ErrorPolicy::Ignore);
        let excludes = ExcludeSet::new(&[]).unwrap();
        let selection = select(&[dir.path().join("src")], &excludes, &ctx.controller).unwrap();
        ctx.cancel().cancel();

        let artifact = dir.path().join("out.tar.zst");
        let err = Pipeline::new(
            StageKind::backup_chain(Encryption::None),
            PipelineSource::Selection(Arc::new(selection)),
            PipelineSink::File(artifact.clone()),
            ctx,
        )
        .unwrap()
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(!artifact.exists());
        assert!(!sink::partial_path(&artifact).exists());
    }

    #[tokio::test]
    async fn test_missing_archive_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, ErrorPolicy::Ignore);

        let err = Pipeline::new(
            StageKind::restore_chain(Encryption::None),
            PipelineSource::Archive(dir.path().join("missing.tar.zst")),
            PipelineSink::Directory(dir.path().join("out")),
            ctx,
        )
        .unwrap()
        .run()
        .await
        .unwrap_err();

        assert!(err.is_fatal());
    }
}
