//! External transform processes (zstd, age, gpg) as pipeline stages.
//!
//! The process reads the stage input on stdin and writes the stage output on
//! stdout. stderr lines are logged and forwarded to the job's subscribers.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::StageContext;
use crate::policy::StageName;
use crate::utils::errors::EngineError;
use crate::ws::EventHub;

/// stderr lines kept for the failure message
const STDERR_TAIL: usize = 5;

/// Command line of one external stage. Never log `envs`: it may carry a
/// passphrase.
pub struct ProcessSpec {
    pub stage: StageName,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(stage: StageName, program: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Run one external stage to completion.
pub async fn run_process(
    spec: ProcessSpec,
    input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    ctx: &StageContext,
) -> crate::Result<()> {
    let stage = spec.stage;
    let program = spec.program_name();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(job_id = %ctx.job_id, stage = %stage, "Spawning {}", program);
    let mut child = command
        .spawn()
        .map_err(|source| EngineError::StageStart { stage, source })?;

    let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
        _ => return Err(EngineError::fatal(stage, format!("{} pipes unavailable", program))),
    };

    let stderr_task = tokio::spawn(forward_stderr(
        stderr,
        program.clone(),
        stage,
        ctx.job_id.clone(),
        ctx.hub.clone(),
    ));

    // Either side failing stops the other, so a child that stopped reading
    // stdin cannot hold a write forever.
    let stop = ctx.cancel().child_token();
    let (fed, drained) = tokio::join!(
        async {
            let fed = feed_stdin(stdin, input, stage, &stop).await;
            if fed.is_err() {
                stop.cancel();
            }
            fed
        },
        async {
            let drained = drain_stdout(stdout, &output, stage, ctx, &stop).await;
            if drained.is_err() {
                stop.cancel();
            }
            drained
        }
    );

    let status = if stop.is_cancelled() {
        terminate(&mut child, ctx.engine.kill_grace()).await;
        None
    } else {
        let waited = tokio::select! {
            _ = ctx.cancel().cancelled() => None,
            status = child.wait() => Some(status),
        };
        match waited {
            Some(status) => Some(status.map_err(|e| EngineError::fatal(stage, e.to_string()))?),
            None => {
                terminate(&mut child, ctx.engine.kill_grace()).await;
                None
            }
        }
    };
    let tail = stderr_task.await.unwrap_or_default();

    if ctx.cancel().is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    let fully_fed = first_cause(fed, drained)?;

    match status {
        Some(status) if !status.success() => Err(EngineError::fatal(stage, exit_message(&program, status, &tail))),
        _ if !fully_fed => Err(EngineError::fatal(stage, format!("{} closed its input early", program))),
        _ => Ok(()),
    }
}

/// The error that stopped the process. A side that only saw the other one
/// stop reports `Cancelled`, which loses to a real cause.
fn first_cause(fed: crate::Result<bool>, drained: crate::Result<()>) -> crate::Result<bool> {
    match (fed, drained) {
        (Err(e), _) if !matches!(e, EngineError::Cancelled) => Err(e),
        (_, Err(e)) if !matches!(e, EngineError::Cancelled) => Err(e),
        (Err(e), _) | (_, Err(e)) => Err(e),
        (Ok(fully_fed), Ok(())) => Ok(fully_fed),
    }
}

/// Copy stage input to the child's stdin. Returns `false` when the child
/// closed stdin before the input ended.
async fn feed_stdin(
    mut stdin: ChildStdin,
    mut input: mpsc::Receiver<Bytes>,
    stage: StageName,
    stop: &CancellationToken,
) -> crate::Result<bool> {
    loop {
        let chunk = tokio::select! {
            _ = stop.cancelled() => return Err(EngineError::Cancelled),
            chunk = input.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let written = tokio::select! {
            _ = stop.cancelled() => return Err(EngineError::Cancelled),
            written = stdin.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(false);
            }
            return Err(EngineError::fatal(stage, e.to_string()));
        }
    }
    // EOF for the child
    tokio::select! {
        _ = stop.cancelled() => return Err(EngineError::Cancelled),
        closed = stdin.shutdown() => {
            if let Err(e) = closed {
                debug!("Closing stdin: {}", e);
            }
        }
    }
    Ok(true)
}

async fn drain_stdout(
    mut stdout: ChildStdout,
    output: &mpsc::Sender<Bytes>,
    stage: StageName,
    ctx: &StageContext,
    stop: &CancellationToken,
) -> crate::Result<()> {
    let chunk_size = ctx.engine.chunk_size.max(1);
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        let n = tokio::select! {
            _ = stop.cancelled() => return Err(EngineError::Cancelled),
            read = stdout.read_buf(&mut buf) => read.map_err(|e| EngineError::fatal(stage, e.to_string()))?,
        };
        if n == 0 {
            break;
        }
        if buf.len() >= chunk_size {
            forward(output, buf.split().freeze(), stop).await?;
        }
    }
    if !buf.is_empty() {
        forward(output, buf.split().freeze(), stop).await?;
    }
    Ok(())
}

/// Pass a chunk downstream. A closed downstream stops this stage without
/// being a cause of its own.
pub(super) async fn send(output: &mpsc::Sender<Bytes>, chunk: Bytes, ctx: &StageContext) -> crate::Result<()> {
    forward(output, chunk, ctx.cancel()).await
}

async fn forward(output: &mpsc::Sender<Bytes>, chunk: Bytes, stop: &CancellationToken) -> crate::Result<()> {
    tokio::select! {
        _ = stop.cancelled() => Err(EngineError::Cancelled),
        sent = output.send(chunk) => sent.map_err(|_| EngineError::Cancelled),
    }
}

async fn forward_stderr(stderr: ChildStderr, program: String, stage: StageName, job_id: String, hub: EventHub) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut lines = BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() || is_pipe_noise(&line) {
                    continue;
                }
                debug!(job_id = %job_id, stage = %stage, "{}: {}", program, line);
                hub.log(&job_id, "stderr", format!("[{}] {}", program, line));
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read {} stderr: {}", program, e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}

/// Messages a transform prints when its neighbour went away first
fn is_pipe_noise(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("broken pipe") || lower.contains("write error")
}

/// SIGTERM, wait up to `grace`, then SIGKILL and reap.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!("Process {} exited with {}", pid, status);
            return;
        }
        warn!("Process {} ignored SIGTERM, killing", pid);
    }

    if let Err(e) = child.kill().await {
        debug!("Kill failed: {}", e);
    }
}

fn exit_message(program: &str, status: ExitStatus, tail: &[String]) -> String {
    match tail.last() {
        Some(line) => format!("{} exited with {}: {}", program, status, line),
        None => format!("{} exited with {}", program, status),
    }
}
