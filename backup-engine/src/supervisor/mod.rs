//! Job supervisor: lifecycle, single-flight per target, cancellation.

pub mod registry;
mod runner;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::fs::split_units;
use crate::job::naming::{artifact_file_name, sanitize_name, split_unit_name};
use crate::job::{Direction, JobId, JobSpec, JobState, JobStatus};
use crate::transfer::progress::ProgressMeter;
use crate::utils::errors::EngineError;
use crate::ws::{EventHub, JobEvent};
use registry::{Target, TargetGuard, TargetRegistry};

/// One subdirectory of a split job and the archive it becomes
#[derive(Debug, Clone)]
pub(crate) struct SplitTarget {
    pub name: String,
    pub root: PathBuf,
    pub artifact: PathBuf,
}

/// What a job writes to or reads from, resolved at submission
#[derive(Debug, Clone)]
pub(crate) enum JobTarget {
    /// One archive under the backups directory
    Archive(PathBuf),
    /// One archive per subdirectory, listed at submission
    Split(Vec<SplitTarget>),
    /// Archive bytes streamed to the caller
    Download,
    /// Split archives written under `staging`, then streamed as one bundle
    SplitDownload { staging: PathBuf, units: Vec<SplitTarget> },
    /// `uploaded` archives are staged copies, removed when the job ends
    Restore {
        archive: PathBuf,
        destination: PathBuf,
        uploaded: bool,
    },
}

impl JobTarget {
    /// Everything the job writes to. Downloads write nothing shared.
    fn claims(&self) -> Vec<Target> {
        match self {
            JobTarget::Archive(artifact) => vec![Target::Artifact(absolute(artifact))],
            JobTarget::Split(units) => units
                .iter()
                .map(|unit| Target::Artifact(absolute(&unit.artifact)))
                .collect(),
            JobTarget::Download | JobTarget::SplitDownload { .. } => Vec::new(),
            JobTarget::Restore { destination, .. } => vec![Target::Tree(absolute(destination))],
        }
    }

    /// Scratch file or directory to remove once the job is over
    pub(crate) fn scratch(&self) -> Option<PathBuf> {
        match self {
            JobTarget::SplitDownload { staging, .. } => Some(staging.clone()),
            JobTarget::Restore {
                archive, uploaded: true, ..
            } => Some(archive.clone()),
            _ => None,
        }
    }
}

pub(crate) struct JobRecord {
    status: Mutex<JobStatus>,
    cancel: CancellationToken,
    state_tx: watch::Sender<JobState>,
    meter: Arc<ProgressMeter>,
}

impl JobRecord {
    fn snapshot(&self) -> JobStatus {
        let mut status = lock_status(self).clone();
        if status.state == JobState::Running {
            status.bytes_processed = self.meter.bytes();
            status.files_processed = self.meter.files();
        }
        status
    }
}

struct Inner {
    config: Config,
    hub: EventHub,
    jobs: DashMap<JobId, Arc<JobRecord>>,
    finished: Mutex<VecDeque<JobId>>,
    targets: TargetRegistry,
}

/// Streamed backup handed to the HTTP layer
pub struct DownloadHandle {
    pub job_id: JobId,
    pub file_name: String,
    pub body: mpsc::Receiver<Bytes>,
}

/// Owns every job. Cheap to clone.
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Inner>,
}

impl JobSupervisor {
    pub fn new(config: Config) -> Self {
        let hub = EventHub::new(config.engine.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                hub,
                jobs: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                targets: TargetRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    /// Validate and start a job. Rejected immediately when anything it
    /// writes to is held by another job.
    pub fn submit(&self, mut spec: JobSpec) -> crate::Result<JobId> {
        spec.validate()?;
        spec.name = spec.display_name();
        let target = self.resolve_target(&spec)?;
        self.launch(spec, target, None)
    }

    /// Start a backup whose archive is streamed back through the returned
    /// receiver. A split backup streams one plain tar holding every
    /// subdirectory's archive.
    pub fn submit_download(&self, mut spec: JobSpec) -> crate::Result<DownloadHandle> {
        spec.validate()?;
        spec.name = spec.display_name();
        if spec.direction != Direction::Backup {
            return Err(EngineError::InvalidSpec("downloads are backups".into()));
        }

        let (target, file_name) = if spec.split {
            let staging = self
                .inner
                .config
                .paths
                .staging_dir
                .join(format!("bundle-{}", Uuid::new_v4()));
            let units = split_targets(&spec, &staging)?;
            let file_name = format!("{}_subdirs.tar", sanitize_name(&spec.name));
            (JobTarget::SplitDownload { staging, units }, file_name)
        } else {
            let file_name = artifact_file_name(&spec.name, spec.effective_encryption());
            (JobTarget::Download, file_name)
        };

        let (tx, rx) = mpsc::channel(self.inner.config.engine.channel_capacity.max(1));
        let job_id = self.launch(spec, target, Some(tx))?;

        Ok(DownloadHandle {
            job_id,
            file_name,
            body: rx,
        })
    }

    /// Restore from an archive sent by the client. The archive is staged
    /// first and removed when the job ends, whatever the outcome. The
    /// destination is claimed before the upload is received.
    pub async fn submit_upload<S, E>(&self, mut spec: JobSpec, file_name: &str, body: S) -> crate::Result<JobId>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let file_name = sanitize_name(file_name);
        spec.direction = Direction::Restore;
        spec.archive = Some(PathBuf::from(&file_name));
        spec.validate()?;
        spec.name = spec.display_name();

        let destination = self.restore_destination(&spec)?;
        let job_id = Uuid::new_v4().to_string();
        let staged = self
            .inner
            .config
            .paths
            .staging_dir
            .join(format!("upload-{}-{}", job_id, file_name));
        spec.archive = Some(staged.clone());

        let target = JobTarget::Restore {
            archive: staged.clone(),
            destination,
            uploaded: true,
        };
        let guard = self.inner.targets.try_acquire(target.claims(), &job_id)?;

        match receive_upload(&staged, body).await {
            Ok(size) => info!(job_id = %job_id, "Received {} ({} bytes)", file_name, size),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&staged).await {
                    debug!("Removing partial upload {}: {}", staged.display(), cleanup);
                }
                return Err(e);
            }
        }

        self.start(job_id.clone(), spec, target, guard, None);
        Ok(job_id)
    }

    fn launch(&self, spec: JobSpec, target: JobTarget, stream: Option<mpsc::Sender<Bytes>>) -> crate::Result<JobId> {
        let job_id = Uuid::new_v4().to_string();
        let guard = self.inner.targets.try_acquire(target.claims(), &job_id)?;
        self.start(job_id.clone(), spec, target, guard, stream);
        Ok(job_id)
    }

    fn start(
        &self,
        job_id: JobId,
        spec: JobSpec,
        target: JobTarget,
        guard: TargetGuard,
        stream: Option<mpsc::Sender<Bytes>>,
    ) {
        let name = spec.name.clone();
        let (state_tx, _) = watch::channel(JobState::Queued);
        let record = Arc::new(JobRecord {
            status: Mutex::new(JobStatus::queued(&job_id, &name, spec.direction)),
            cancel: CancellationToken::new(),
            state_tx,
            meter: Arc::new(ProgressMeter::new()),
        });

        self.inner.hub.register(&job_id);
        self.inner.jobs.insert(job_id.clone(), Arc::clone(&record));
        info!(job_id = %job_id, targets = ?guard.targets(), "Queued {:?} job '{}'", spec.direction, name);

        let supervisor = self.clone();
        tokio::spawn(async move {
            let outcome = runner::run_job(&supervisor, &record, &job_id, spec, target, stream).await;
            supervisor.finish(&record, guard, outcome);
        });
    }

    /// Request cancellation. Cancelling a finished job is a no-op.
    pub fn cancel(&self, job_id: &str) -> crate::Result<JobStatus> {
        let record = self.record(job_id)?;
        let status = record.snapshot();
        if !status.is_terminal() && !record.cancel.is_cancelled() {
            info!(job_id = %job_id, "Cancellation requested");
            record.cancel.cancel();
            self.inner.hub.log(job_id, "warn", "Cancellation requested");
        }
        Ok(status)
    }

    pub fn status(&self, job_id: &str) -> crate::Result<JobStatus> {
        Ok(self.record(job_id)?.snapshot())
    }

    /// Every known job, oldest first
    pub fn list(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self.inner.jobs.iter().map(|r| r.value().snapshot()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .jobs
            .iter()
            .filter(|r| !r.value().snapshot().is_terminal())
            .count()
    }

    /// Events of one job. A finished job yields its final status, then the
    /// stream ends.
    pub fn subscribe(&self, job_id: &str) -> crate::Result<broadcast::Receiver<JobEvent>> {
        let record = self.record(job_id)?;
        let status = lock_status(&record);
        if !status.is_terminal() {
            if let Some(rx) = self.inner.hub.subscribe(job_id) {
                return Ok(rx);
            }
        }
        let (tx, rx) = broadcast::channel(1);
        let _ = tx.send(JobEvent::Finished(status.clone()));
        Ok(rx)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.hub.subscribe_all()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, job_id: &str) -> crate::Result<JobStatus> {
        let record = self.record(job_id)?;
        let mut rx = record.state_tx.subscribe();
        // The sender lives in the record, so this only ends on a terminal state
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        Ok(record.snapshot())
    }

    /// Cancel every active job
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.inner.jobs.iter() {
            let record = entry.value();
            if !record.snapshot().is_terminal() {
                record.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Wait, bounded, for every active job to finish. Returns whether they did.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let active: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|r| !r.value().snapshot().is_terminal())
            .map(|r| r.key().clone())
            .collect();

        tokio::time::timeout(timeout, async {
            for job_id in active {
                let _ = self.wait(&job_id).await;
            }
        })
        .await
        .is_ok()
    }

    fn record(&self, job_id: &str) -> crate::Result<Arc<JobRecord>> {
        self.inner
            .jobs
            .get(job_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    fn resolve_target(&self, spec: &JobSpec) -> crate::Result<JobTarget> {
        let paths = &self.inner.config.paths;
        match spec.direction {
            Direction::Backup if spec.split => Ok(JobTarget::Split(split_targets(spec, &paths.backups_dir)?)),
            Direction::Backup => {
                let file_name = artifact_file_name(&spec.name, spec.effective_encryption());
                Ok(JobTarget::Archive(paths.backups_dir.join(file_name)))
            }
            Direction::Restore => {
                let requested = spec
                    .archive
                    .as_deref()
                    .ok_or_else(|| EngineError::InvalidSpec("restore needs an archive".into()))?;
                let archive = resolve_archive(&paths.backups_dir, requested);
                if !archive.is_file() {
                    return Err(EngineError::InvalidSpec(format!(
                        "archive not found: {}",
                        archive.display()
                    )));
                }
                Ok(JobTarget::Restore {
                    archive,
                    destination: self.restore_destination(spec)?,
                    uploaded: false,
                })
            }
        }
    }

    fn restore_destination(&self, spec: &JobSpec) -> crate::Result<PathBuf> {
        let destination = spec
            .destination
            .clone()
            .unwrap_or_else(|| self.inner.config.paths.restore_dir.clone());
        Ok(std::path::absolute(&destination)?)
    }

    /// Record the terminal state, release the target, notify subscribers.
    fn finish(&self, record: &Arc<JobRecord>, guard: TargetGuard, outcome: runner::JobOutcome) {
        drop(guard);

        let (job_id, final_state) = {
            let mut status = lock_status(record);
            if status.transition(outcome.state) {
                status.summary = outcome.summary;
                status.artifacts = outcome.artifacts;
                status.failure_count = outcome.failures.len();
                status.failures = outcome.failures;
                status.bytes_processed = record.meter.bytes();
                status.files_processed = record.meter.files();
                status.total_bytes = outcome.total_bytes;
            } else {
                warn!(job_id = %status.job_id, "Ignoring transition {} -> {}", status.state, outcome.state);
            }
            // Published under the lock so `subscribe` never misses it
            self.inner.hub.publish(JobEvent::Finished(status.clone()));
            (status.job_id.clone(), status.state)
        };
        info!(job_id = %job_id, "Job finished: {}", final_state);

        record.state_tx.send_replace(final_state);
        self.inner.hub.close(&job_id);
        self.prune(job_id);
    }

    /// Forget the oldest finished jobs beyond the retention limit
    fn prune(&self, job_id: JobId) {
        let limit = self.inner.config.engine.retain_finished_jobs;
        let expired: Vec<JobId> = match self.inner.finished.lock() {
            Ok(mut finished) => {
                finished.push_back(job_id);
                let excess = finished.len().saturating_sub(limit);
                finished.drain(..excess).collect()
            }
            Err(_) => Vec::new(),
        };
        for id in expired {
            self.inner.jobs.remove(&id);
        }
    }

    /// Mark a queued job as running. `false` when it was cancelled first.
    pub(crate) fn mark_running(&self, record: &JobRecord) -> bool {
        if record.cancel.is_cancelled() {
            return false;
        }
        let mut status = lock_status(record);
        let started = status.transition(JobState::Running);
        drop(status);
        if started {
            record.state_tx.send_replace(JobState::Running);
        }
        started
    }

    pub(crate) fn set_total(&self, record: &JobRecord, total: Option<u64>) {
        lock_status(record).total_bytes = total;
    }
}

fn lock_status(record: &JobRecord) -> std::sync::MutexGuard<'_, JobStatus> {
    match record.status.lock() {
        Ok(status) => status,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// List the subdirectories of a split backup and name their archives under `dir`
fn split_targets(spec: &JobSpec, dir: &Path) -> crate::Result<Vec<SplitTarget>> {
    let encryption = spec.effective_encryption();
    let units = split_units(&spec.paths).map_err(|e| EngineError::InvalidSpec(e.to_string()))?;
    Ok(units
        .into_iter()
        .map(|unit| SplitTarget {
            artifact: dir.join(artifact_file_name(&split_unit_name(&spec.name, &unit.name), encryption)),
            name: unit.name,
            root: unit.root,
        })
        .collect())
}

/// Copy an upload to `path`
async fn receive_upload<S, E>(path: &Path, body: S) -> crate::Result<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut body = std::pin::pin!(body);
    let mut received = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| EngineError::InvalidSpec(format!("upload interrupted: {}", e)))?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;

    if received == 0 {
        return Err(EngineError::InvalidSpec("uploaded archive is empty".into()));
    }
    Ok(received)
}

/// Bare names live in the backups directory; other paths are used as given.
fn resolve_archive(backups_dir: &Path, requested: &Path) -> PathBuf {
    if requested.is_absolute() || requested.components().count() > 1 {
        requested.to_path_buf()
    } else {
        backups_dir.join(requested)
    }
}
