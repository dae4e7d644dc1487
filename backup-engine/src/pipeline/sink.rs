//! Pipeline ends: the archive file a restore reads from, and the file or
//! caller stream a backup writes to.

use bytes::Bytes;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::process::send;
use super::StageContext;
use crate::policy::StageName;
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::errors::EngineError;

/// `<artifact>.partial`
pub fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Stream an archive file into the pipeline, counting bytes read.
pub async fn read_file(path: &Path, output: mpsc::Sender<Bytes>, ctx: &StageContext) -> crate::Result<()> {
    let file = File::open(path)
        .await
        .map_err(|e| EngineError::fatal(StageName::Source, format!("cannot open {}: {}", path.display(), e)))?;

    let meter = Arc::clone(&ctx.meter);
    let stream = ReaderStream::with_capacity(file, ctx.engine.chunk_size.max(1));
    let mut stream = ProgressStream::new(stream, Arc::new(move |delta: u64| meter.add_bytes(delta)));

    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel().cancelled() => return Err(EngineError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => send(&output, chunk, ctx).await?,
            Some(Err(e)) => {
                return Err(EngineError::fatal(
                    StageName::Source,
                    format!("reading {}: {}", path.display(), e),
                ))
            }
            None => break,
        }
    }

    debug!(job_id = %ctx.job_id, "Read {} bytes from {}", stream.bytes_transferred(), path.display());
    Ok(())
}

/// Write the pipeline output to `partial`. The caller renames it once every
/// stage has succeeded.
pub async fn write_file(mut input: mpsc::Receiver<Bytes>, partial: &Path, ctx: &StageContext) -> crate::Result<()> {
    let unwritable = |e: std::io::Error| EngineError::fatal(StageName::Sink, format!("{}: {}", partial.display(), e));

    if let Some(parent) = partial.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(unwritable)?;
    }
    let mut file = File::create(partial).await.map_err(unwritable)?;

    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel().cancelled() => return Err(EngineError::Cancelled),
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        file.write_all(&chunk).await.map_err(unwritable)?;
    }

    file.flush().await.map_err(unwritable)?;
    file.sync_all().await.map_err(unwritable)?;
    Ok(())
}

/// Hand the pipeline output to the caller. The caller going away is a
/// destination loss.
pub async fn forward(mut input: mpsc::Receiver<Bytes>, output: mpsc::Sender<Bytes>, ctx: &StageContext) -> crate::Result<()> {
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel().cancelled() => return Err(EngineError::Cancelled),
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            return Ok(());
        };
        tokio::select! {
            _ = ctx.cancel().cancelled() => return Err(EngineError::Cancelled),
            sent = output.send(chunk) => {
                if sent.is_err() {
                    return Err(EngineError::fatal(StageName::Sink, "client disconnected"));
                }
            }
        }
    }
}

/// Publish a finished artifact
pub async fn finalize(partial: &Path, artifact: &Path) -> crate::Result<()> {
    tokio::fs::rename(partial, artifact).await.map_err(|e| {
        EngineError::fatal(
            StageName::Sink,
            format!("cannot rename {} to {}: {}", partial.display(), artifact.display(), e),
        )
    })
}

/// Remove the output of a failed or cancelled unit
pub async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!("Removed {}", partial.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", partial.display(), e),
    }
}
