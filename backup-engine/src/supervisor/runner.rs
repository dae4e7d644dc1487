//! Drives one job: selection, one pipeline per unit, progress reporting and
//! aggregation of the unit results into a terminal state.

use bytes::Bytes;
use futures_util::{stream, FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{JobRecord, JobSupervisor, JobTarget};
use crate::config::{EngineConfig, ToolsConfig};
use crate::fs::selector::prune_redundant_paths;
use crate::fs::{select, ExcludeSet, SelectionResult};
use crate::job::naming::artifact_file_name;
use crate::job::{Direction, JobSpec, JobState, Secret};
use crate::pipeline::archive::write_bundle;
use crate::pipeline::bridge::ChannelWriter;
use crate::pipeline::{Pipeline, PipelineSink, PipelineSource, PipelineSummary, StageContext, StageKind};
use crate::policy::{ErrorPolicy, ErrorPolicyController, FailureRecord, FailureReport, StageName};
use crate::transfer::progress::{format_bytes, ProgressMeter, ProgressTracker};
use crate::utils::errors::EngineError;
use crate::ws::{EventHub, JobEvent};

/// Terminal result of a job, applied to its status by the supervisor
pub(crate) struct JobOutcome {
    pub state: JobState,
    pub summary: String,
    pub artifacts: Vec<PathBuf>,
    pub failures: FailureReport,
    pub total_bytes: Option<u64>,
}

impl JobOutcome {
    fn failed(summary: impl Into<String>, failures: FailureReport, total_bytes: Option<u64>) -> Self {
        Self {
            state: JobState::Failed,
            summary: summary.into(),
            artifacts: Vec::new(),
            failures,
            total_bytes,
        }
    }

    fn cancelled(total_bytes: Option<u64>) -> Self {
        Self {
            state: JobState::Cancelled,
            summary: "Cancelled".to_string(),
            artifacts: Vec::new(),
            failures: FailureReport::default(),
            total_bytes,
        }
    }
}

/// A pipeline ready to run
struct Unit {
    label: String,
    controller: Arc<ErrorPolicyController>,
    stages: Vec<StageKind>,
    source: PipelineSource,
    sink: PipelineSink,
    subject: PathBuf,
}

struct UnitResult {
    label: String,
    result: crate::Result<PipelineSummary>,
    failures: FailureReport,
}

/// Units that made it through selection, units that did not, and the
/// advisory byte total
struct Plan {
    units: Vec<Unit>,
    rejected: Vec<UnitResult>,
    total_bytes: Option<u64>,
}

/// Shared by every unit of a job
struct UnitEnv {
    job_id: String,
    job_cancel: CancellationToken,
    hub: EventHub,
    meter: Arc<ProgressMeter>,
    live_files: bool,
    engine: EngineConfig,
    tools: ToolsConfig,
    secret: Option<Secret>,
}

pub(crate) async fn run_job(
    supervisor: &JobSupervisor,
    record: &JobRecord,
    job_id: &str,
    spec: JobSpec,
    target: JobTarget,
    stream: Option<mpsc::Sender<Bytes>>,
) -> JobOutcome {
    let scratch = target.scratch();
    let run = AssertUnwindSafe(execute(supervisor, record, job_id, spec, target, stream));
    let outcome = match run.catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(job_id = %job_id, "Job task panicked");
            record.cancel.cancel();
            JobOutcome::failed("Internal error", FailureReport::default(), None)
        }
    };

    if let Some(scratch) = scratch {
        remove_scratch(&scratch).await;
    }
    outcome
}

async fn remove_scratch(path: &Path) {
    let removed = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

async fn execute(
    supervisor: &JobSupervisor,
    record: &JobRecord,
    job_id: &str,
    spec: JobSpec,
    target: JobTarget,
    stream: Option<mpsc::Sender<Bytes>>,
) -> JobOutcome {
    if !supervisor.mark_running(record) {
        return JobOutcome::cancelled(None);
    }

    let config = supervisor.config();
    let hub = supervisor.hub().clone();
    let env = UnitEnv {
        job_id: job_id.to_string(),
        job_cancel: record.cancel.clone(),
        hub: hub.clone(),
        meter: Arc::clone(&record.meter),
        live_files: spec.live_file_progress,
        engine: config.engine.clone(),
        tools: config.tools.clone(),
        secret: spec.secret.clone(),
    };

    hub.log(job_id, "info", format!("Starting {:?} job '{}'", spec.direction, spec.name));

    // Split downloads run their units into files and stream the bundle last
    let (bundle_output, stream) = match target {
        JobTarget::SplitDownload { .. } => (stream, None),
        _ => (None, stream),
    };

    let plan = match plan(&spec, target, stream, &env).await {
        Ok(plan) => plan,
        Err(EngineError::Cancelled) => return JobOutcome::cancelled(None),
        Err(e) => {
            error!(job_id = %job_id, "Job could not start: {}", e);
            let mut failures = FailureReport::default();
            let subject = spec.paths.first().cloned().unwrap_or_default();
            failures.push(failure_record(subject, &e));
            return JobOutcome::failed(format!("Failed: {}", e), failures, None);
        }
    };

    supervisor.set_total(record, plan.total_bytes);
    hub.publish(JobEvent::Started {
        job_id: job_id.to_string(),
        name: spec.name.clone(),
        direction: spec.direction,
        units: plan.units.len() + plan.rejected.len(),
    });

    let done = CancellationToken::new();
    let reporter = tokio::spawn(report_progress(
        hub.clone(),
        Arc::clone(&record.meter),
        job_id.to_string(),
        plan.total_bytes,
        config.engine.progress_interval(),
        config.engine.throughput_window(),
        done.clone(),
    ));

    let parallel = config.engine.max_parallel_units.max(1);
    let mut results = plan.rejected;
    let finished: Vec<UnitResult> = stream::iter(plan.units)
        .map(|unit| run_unit(unit, &env))
        .buffer_unordered(parallel)
        .collect()
        .await;
    results.extend(finished);

    done.cancel();
    if let Err(e) = reporter.await {
        warn!(job_id = %job_id, "Progress reporter failed: {}", e);
    }

    let mut outcome = aggregate(
        results,
        spec.error_policy,
        spec.split,
        record.cancel.is_cancelled(),
        spec.direction,
        &record.meter,
    );
    outcome.total_bytes = plan.total_bytes;

    if let Some(output) = bundle_output {
        outcome = send_bundle(outcome, output, &env).await;
    }
    outcome
}

/// Stream the finished archives of a split download as one tar. The staged
/// archives are scratch files, so the status lists no artifacts.
async fn send_bundle(outcome: JobOutcome, output: mpsc::Sender<Bytes>, env: &UnitEnv) -> JobOutcome {
    if !matches!(outcome.state, JobState::Completed | JobState::CompletedWithFailures) {
        return outcome;
    }

    env.hub.log(
        &env.job_id,
        "info",
        format!("Streaming {} archive(s) as one bundle", outcome.artifacts.len()),
    );
    let writer = ChannelWriter::new(output, env.engine.chunk_size.max(1), env.job_cancel.clone());
    let artifacts = outcome.artifacts.clone();
    let cancel = env.job_cancel.clone();
    let sent = tokio::task::spawn_blocking(move || write_bundle(&artifacts, writer, &cancel))
        .await
        .unwrap_or_else(|e| Err(EngineError::fatal(StageName::Sink, format!("bundle task failed: {}", e))));

    match sent {
        Ok(()) => JobOutcome {
            artifacts: Vec::new(),
            ..outcome
        },
        Err(EngineError::Cancelled) => JobOutcome::cancelled(outcome.total_bytes),
        Err(e) => {
            error!(job_id = %env.job_id, "Bundle failed: {}", e);
            let mut failures = outcome.failures;
            failures.push(failure_record(PathBuf::from("bundle"), &e));
            JobOutcome::failed(format!("Failed: {}", e), failures, outcome.total_bytes)
        }
    }
}

/// Resolve the units of a job. Backups run selection here, before any
/// stage starts.
async fn plan(
    spec: &JobSpec,
    target: JobTarget,
    stream: Option<mpsc::Sender<Bytes>>,
    env: &UnitEnv,
) -> crate::Result<Plan> {
    let encryption = spec.effective_encryption();

    let candidates = match target {
        JobTarget::Restore {
            archive, destination, ..
        } => {
            let total = tokio::fs::metadata(&archive).await.ok().map(|m| m.len());
            let controller = unit_controller(spec.error_policy, &env.job_cancel);
            return Ok(Plan {
                units: vec![Unit {
                    label: spec.name.clone(),
                    controller,
                    stages: StageKind::restore_chain(encryption),
                    source: PipelineSource::Archive(archive.clone()),
                    sink: PipelineSink::Directory(destination),
                    subject: archive,
                }],
                rejected: Vec::new(),
                total_bytes: total,
            });
        }
        JobTarget::Archive(artifact) => {
            vec![(spec.name.clone(), spec.paths.clone(), PipelineSink::File(artifact.clone()), artifact)]
        }
        JobTarget::Download => {
            let output = stream.ok_or_else(|| EngineError::InvalidSpec("download has no output stream".into()))?;
            let subject = PathBuf::from(artifact_file_name(&spec.name, encryption));
            vec![(spec.name.clone(), spec.paths.clone(), PipelineSink::Stream(output), subject)]
        }
        JobTarget::Split(units) | JobTarget::SplitDownload { units, .. } => {
            if units.is_empty() {
                warn!(job_id = %env.job_id, "No subdirectories to back up");
                env.hub.log(&env.job_id, "warn", "No subdirectories to back up");
            }
            units
                .into_iter()
                .map(|unit| {
                    let artifact = unit.artifact;
                    (unit.name, vec![unit.root], PipelineSink::File(artifact.clone()), artifact)
                })
                .collect()
        }
    };

    let excludes = Arc::new(ExcludeSet::new(&spec.exclude)?);
    let mut plan = Plan {
        units: Vec::with_capacity(candidates.len()),
        rejected: Vec::new(),
        total_bytes: None,
    };
    let mut total = 0u64;

    for (label, paths, sink, subject) in candidates {
        if let Ok(roots) = prune_redundant_paths(&paths) {
            if roots.len() < paths.len() {
                env.hub.log(
                    &env.job_id,
                    "info",
                    format!("Pruned nested sources, backing up {} of {} paths", roots.len(), paths.len()),
                );
            }
        }

        let controller = unit_controller(spec.error_policy, &env.job_cancel);
        let selected = select_unit(paths, Arc::clone(&excludes), Arc::clone(&controller)).await;

        match selected {
            Ok(selection) => {
                info!(
                    job_id = %env.job_id,
                    "Selected {} entries ({}) for '{}'",
                    selection.entries.len(),
                    format_bytes(selection.total_bytes),
                    label
                );
                total += selection.total_bytes;
                plan.units.push(Unit {
                    label,
                    controller,
                    stages: StageKind::backup_chain(encryption),
                    source: PipelineSource::Selection(Arc::new(selection)),
                    sink,
                    subject,
                });
            }
            Err(EngineError::Cancelled) if env.job_cancel.is_cancelled() => return Err(EngineError::Cancelled),
            Err(e) => {
                warn!(job_id = %env.job_id, "Selection failed for '{}': {}", label, e);
                env.hub.log(&env.job_id, "error", format!("Selection failed for '{}': {}", label, e));
                let mut failures = controller.report();
                if !matches!(e, EngineError::PerEntryIo { .. }) {
                    failures.push(failure_record(subject, &e));
                }
                plan.rejected.push(UnitResult {
                    label,
                    result: Err(e),
                    failures,
                });
            }
        }
    }

    plan.total_bytes = Some(total);
    Ok(plan)
}

fn unit_controller(policy: ErrorPolicy, job_cancel: &CancellationToken) -> Arc<ErrorPolicyController> {
    Arc::new(ErrorPolicyController::new(policy, job_cancel.child_token()))
}

async fn select_unit(
    paths: Vec<PathBuf>,
    excludes: Arc<ExcludeSet>,
    controller: Arc<ErrorPolicyController>,
) -> crate::Result<SelectionResult> {
    tokio::task::spawn_blocking(move || select(&paths, &excludes, &controller))
        .await
        .map_err(|e| EngineError::Selection(format!("selection task failed: {}", e)))?
}

async fn run_unit(unit: Unit, env: &UnitEnv) -> UnitResult {
    let Unit {
        label,
        controller,
        stages,
        source,
        sink,
        subject,
    } = unit;

    let ctx = Arc::new(StageContext {
        job_id: env.job_id.clone(),
        controller: Arc::clone(&controller),
        meter: Arc::clone(&env.meter),
        hub: env.hub.clone(),
        live_files: env.live_files,
        engine: env.engine.clone(),
        tools: env.tools.clone(),
        secret: env.secret.clone(),
        subject: subject.clone(),
    });

    env.hub.log(&env.job_id, "info", format!("Starting unit '{}'", label));

    let mut failures = FailureReport::default();
    let result = match Pipeline::new(stages, source, sink, ctx) {
        Ok(pipeline) => pipeline.run().await,
        Err(e) => {
            failures.push(failure_record(subject, &e));
            Err(e)
        }
    };

    match &result {
        Ok(_) => env.hub.log(&env.job_id, "info", format!("Unit '{}' finished", label)),
        Err(EngineError::Cancelled) => env.hub.log(&env.job_id, "warn", format!("Unit '{}' cancelled", label)),
        Err(e) => {
            // Fatal errors end the whole job, not just this unit
            if e.is_fatal() {
                env.job_cancel.cancel();
            }
            env.hub.log(&env.job_id, "error", format!("Unit '{}' failed: {}", label, e));
        }
    }

    let mut report = controller.report();
    report.extend(failures);
    UnitResult {
        label,
        result,
        failures: report,
    }
}

/// Fold unit results into the job's terminal state.
///
/// Fatal errors fail the job. Otherwise a cancelled job is Cancelled. A unit
/// error fails the job under `abort` or when it is the only unit; split
/// units under `ignore` only contribute their failures.
fn aggregate(
    results: Vec<UnitResult>,
    policy: ErrorPolicy,
    split: bool,
    cancelled: bool,
    direction: Direction,
    meter: &ProgressMeter,
) -> JobOutcome {
    let mut failures = FailureReport::default();
    let mut artifacts = Vec::new();
    let mut fatal = None;
    let mut aborted = None;

    for unit in results {
        failures.extend(unit.failures);
        match unit.result {
            Ok(summary) => artifacts.extend(summary.artifact),
            Err(EngineError::Cancelled) => {}
            Err(e) if e.is_fatal() => {
                fatal.get_or_insert_with(|| describe(&unit.label, &e, split));
            }
            Err(e) => {
                if !split || policy == ErrorPolicy::Abort {
                    aborted.get_or_insert_with(|| describe(&unit.label, &e, split));
                }
            }
        }
    }
    artifacts.sort();

    let verb = match direction {
        Direction::Backup => "Backed up",
        Direction::Restore => "Restored",
    };
    let done = format!("{} {} files ({})", verb, meter.files(), format_bytes(meter.bytes()));

    let (state, summary) = if let Some(reason) = fatal {
        (JobState::Failed, format!("Failed: {}", reason))
    } else if cancelled {
        (JobState::Cancelled, "Cancelled".to_string())
    } else if let Some(reason) = aborted {
        (JobState::Failed, format!("Failed: {}", reason))
    } else if !failures.is_empty() {
        (
            JobState::CompletedWithFailures,
            format!("{} with {} failure(s)", done, failures.len()),
        )
    } else {
        (JobState::Completed, done)
    };

    JobOutcome {
        state,
        summary,
        artifacts,
        failures,
        total_bytes: None,
    }
}

fn describe(label: &str, err: &EngineError, split: bool) -> String {
    if split {
        format!("{}: {}", label, err)
    } else {
        err.to_string()
    }
}

fn failure_record(subject: PathBuf, err: &EngineError) -> FailureRecord {
    let stage = match err {
        EngineError::StageStart { stage, .. }
        | EngineError::PipelineFatal { stage, .. }
        | EngineError::PerEntryIo { stage, .. } => *stage,
        _ => StageName::Selection,
    };
    FailureRecord::new(subject, stage, err.kind(), err.to_string())
}

/// Sample the meter at a fixed cadence and publish snapshots until `done`,
/// then publish a final one.
async fn report_progress(
    hub: EventHub,
    meter: Arc<ProgressMeter>,
    job_id: String,
    total_bytes: Option<u64>,
    interval: Duration,
    window: Duration,
    done: CancellationToken,
) {
    let mut tracker = ProgressTracker::new(job_id, total_bytes, window);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let finished = tokio::select! {
            _ = done.cancelled() => true,
            _ = ticker.tick() => false,
        };

        let delta = meter.bytes().saturating_sub(tracker.processed());
        let current = meter.current_file();
        tracker.record(delta, current.as_deref());
        tracker.set_files_processed(meter.files());
        hub.publish(JobEvent::Progress(tracker.snapshot()));

        if finished {
            break;
        }
    }
}
