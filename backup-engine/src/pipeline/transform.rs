//! Byte-stream transforms: compression and encryption.
//!
//! zstd runs in-process through `async-compression` unless an external
//! binary is configured; age and gpg always run as external processes.

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::bridge::receiver_reader;
use super::process::{run_process, send, ProcessSpec};
use super::{Cipher, StageContext, StageKind};
use crate::policy::StageName;
use crate::utils::errors::EngineError;

/// Environment variable carrying an age passphrase
pub const AGE_PASSPHRASE_ENV: &str = "AGE_PASSPHRASE";

/// Run one transform stage from `input` to `output`.
pub async fn run(
    kind: StageKind,
    input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    ctx: &StageContext,
) -> crate::Result<()> {
    match external_command(kind, ctx)? {
        Some(spec) => run_process(spec, input, output, ctx).await,
        None => match kind {
            StageKind::Compress => {
                let level = Level::Precise(ctx.engine.compression_level);
                let encoder = ZstdEncoder::with_quality(receiver_reader(input), level);
                pump(encoder, &output, StageName::Compress, ctx).await
            }
            StageKind::Decompress => {
                let mut decoder = ZstdDecoder::new(receiver_reader(input));
                decoder.multiple_members(true);
                pump(decoder, &output, StageName::Decompress, ctx).await
            }
            other => Err(EngineError::InvalidSpec(format!("{:?} is not a transform stage", other))),
        },
    }
}

/// Command line for `kind`, or `None` when it runs in-process.
pub fn external_command(kind: StageKind, ctx: &StageContext) -> crate::Result<Option<ProcessSpec>> {
    let tools = &ctx.tools;
    let secret = ctx.secret.as_ref().map(|s| s.expose()).filter(|s| !s.trim().is_empty());

    let spec = match kind {
        StageKind::Compress => tools.zstd.as_ref().map(|zstd| {
            let level = ctx.engine.compression_level;
            let spec = ProcessSpec::new(StageName::Compress, zstd).args(["-q", "-T0"]);
            let spec = if level > 19 { spec.arg("--ultra") } else { spec };
            spec.arg(format!("-{}", level)).arg("-c")
        }),
        StageKind::Decompress => tools
            .zstd
            .as_ref()
            .map(|zstd| ProcessSpec::new(StageName::Decompress, zstd).args(["-q", "-d", "-c"])),
        StageKind::Encrypt(Cipher::Age) => {
            let secret = secret.ok_or_else(|| missing_secret(StageName::Encrypt))?;
            let spec = ProcessSpec::new(StageName::Encrypt, &tools.age);
            Some(if secret.starts_with("age1") {
                spec.args(["-r", secret, "-o", "-"])
            } else {
                spec.env(AGE_PASSPHRASE_ENV, secret).args(["-p", "-o", "-"])
            })
        }
        StageKind::Decrypt(Cipher::Age) => {
            let secret = secret.ok_or_else(|| missing_secret(StageName::Decrypt))?;
            let spec = ProcessSpec::new(StageName::Decrypt, &tools.age).arg("--decrypt");
            Some(if Path::new(secret).is_file() {
                spec.args(["-i", secret])
            } else {
                spec.env(AGE_PASSPHRASE_ENV, secret)
            })
        }
        StageKind::Encrypt(Cipher::Gpg) => {
            let recipient = secret.ok_or_else(|| missing_secret(StageName::Encrypt))?;
            Some(ProcessSpec::new(StageName::Encrypt, &tools.gpg).args([
                "--batch",
                "--yes",
                "--encrypt",
                "--recipient",
                recipient,
                "--output",
                "-",
            ]))
        }
        StageKind::Decrypt(Cipher::Gpg) => {
            let spec = ProcessSpec::new(StageName::Decrypt, &tools.gpg).args(["--batch", "--yes", "--decrypt"]);
            let spec = match secret {
                Some(passphrase) => spec.args(["--pinentry-mode", "loopback", "--passphrase", passphrase]),
                None => spec,
            };
            Some(spec.args(["--output", "-"]))
        }
        StageKind::Archive | StageKind::Unarchive => None,
    };
    Ok(spec)
}

fn missing_secret(stage: StageName) -> EngineError {
    EngineError::StageStart {
        stage,
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no secret supplied"),
    }
}

/// Read `reader` to the end, passing chunks downstream.
async fn pump<R>(mut reader: R, output: &mpsc::Sender<Bytes>, stage: StageName, ctx: &StageContext) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = ctx.engine.chunk_size.max(1);
    let cancel = ctx.cancel();
    let mut buf = BytesMut::with_capacity(chunk_size);

    loop {
        buf.reserve(chunk_size);
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            read = reader.read_buf(&mut buf) => match read {
                Ok(n) => n,
                Err(_) if cancel.is_cancelled() => return Err(EngineError::Cancelled),
                Err(e) => return Err(EngineError::fatal(stage, format!("corrupt or truncated stream: {}", e))),
            },
        };
        if n == 0 {
            break;
        }
        if buf.len() >= chunk_size {
            send(output, buf.split().freeze(), ctx).await?;
        }
    }

    if !buf.is_empty() {
        send(output, buf.split().freeze(), ctx).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ToolsConfig};
    use crate::job::Secret;
    use crate::policy::{ErrorPolicy, ErrorPolicyController};
    use crate::transfer::progress::ProgressMeter;
    use crate::ws::EventHub;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn context(secret: Option<&str>, zstd: Option<&str>) -> StageContext {
        StageContext {
            job_id: "transform-test".to_string(),
            controller: Arc::new(ErrorPolicyController::new(ErrorPolicy::Ignore, CancellationToken::new())),
            meter: Arc::new(ProgressMeter::new()),
            hub: EventHub::new(16),
            live_files: false,
            engine: EngineConfig::default(),
            tools: ToolsConfig {
                zstd: zstd.map(PathBuf::from),
                ..ToolsConfig::default()
            },
            secret: secret.map(Secret::new),
            subject: PathBuf::from("/tmp/out"),
        }
    }

    async fn run_transform(kind: StageKind, data: Vec<u8>, ctx: &StageContext) -> crate::Result<Vec<u8>> {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let feeder = tokio::spawn(async move {
            for chunk in data.chunks(1000) {
                if in_tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = out_rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });

        let result = run(kind, in_rx, out_tx, ctx).await;
        feeder.await.unwrap();
        let out = collector.await.unwrap();
        result.map(|_| out)
    }

    #[tokio::test]
    async fn test_builtin_zstd_roundtrip() {
        let ctx = context(None, None);
        let data: Vec<u8> = (0..50_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();

        let compressed = run_transform(StageKind::Compress, data.clone(), &ctx).await.unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(zstd::decode_all(compressed.as_slice()).unwrap(), data);

        let restored = run_transform(StageKind::Decompress, compressed, &ctx).await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_corrupt_input_is_fatal() {
        let ctx = context(None, None);
        let err = run_transform(StageKind::Decompress, b"definitely not zstd".to_vec(), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_age_command_lines() {
        let ctx = context(Some("correct horse"), None);
        let spec = external_command(StageKind::Encrypt(Cipher::Age), &ctx).unwrap().unwrap();
        assert_eq!(spec.args, vec!["-p", "-o", "-"]);
        assert_eq!(
            spec.envs,
            vec![(AGE_PASSPHRASE_ENV.to_string(), "correct horse".to_string())]
        );

        let ctx = context(Some("age1qqqqrecipient"), None);
        let spec = external_command(StageKind::Encrypt(Cipher::Age), &ctx).unwrap().unwrap();
        assert_eq!(spec.args, vec!["-r", "age1qqqqrecipient", "-o", "-"]);
        assert!(spec.envs.is_empty());

        let ctx = context(None, None);
        assert!(matches!(
            external_command(StageKind::Decrypt(Cipher::Age), &ctx),
            Err(EngineError::StageStart { .. })
        ));
    }

    #[test]
    fn test_gpg_command_lines() {
        let ctx = context(Some("ops@example.com"), None);
        let spec = external_command(StageKind::Encrypt(Cipher::Gpg), &ctx).unwrap().unwrap();
        assert!(spec.args.windows(2).any(|w| w == ["--recipient", "ops@example.com"]));

        let spec = external_command(StageKind::Decrypt(Cipher::Gpg), &ctx).unwrap().unwrap();
        assert!(spec.args.windows(2).any(|w| w == ["--pinentry-mode", "loopback"]));

        let ctx = context(None, None);
        let spec = external_command(StageKind::Decrypt(Cipher::Gpg), &ctx).unwrap().unwrap();
        assert!(!spec.args.iter().any(|a| a == "--passphrase"));
    }

    #[test]
    fn test_zstd_runs_in_process_unless_configured() {
        let ctx = context(None, None);
        assert!(external_command(StageKind::Compress, &ctx).unwrap().is_none());

        let ctx = context(None, Some("/usr/bin/zstd"));
        let spec = external_command(StageKind::Compress, &ctx).unwrap().unwrap();
        assert_eq!(spec.args, vec!["-q", "-T0", "-3", "-c"]);
        let spec = external_command(StageKind::Decompress, &ctx).unwrap().unwrap();
        assert_eq!(spec.args, vec!["-q", "-d", "-c"]);
    }
}
