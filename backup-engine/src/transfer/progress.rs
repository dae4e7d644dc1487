//! Byte-level progress tracking for backup and restore jobs.
//!
//! Pipeline stages only bump the lock-free counters of a [`ProgressMeter`].
//! A reporter task samples the meter at a fixed cadence and feeds a
//! [`ProgressTracker`], which smooths throughput and derives the ETA.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counters shared between the stages of a job and its reporter
#[derive(Debug, Default)]
pub struct ProgressMeter {
    bytes: AtomicU64,
    files: AtomicUsize,
    current_file: Mutex<Option<String>>,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, delta: u64) {
        self.bytes.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_file(&self, name: impl Into<String>) {
        if let Ok(mut current) = self.current_file.lock() {
            *current = Some(name.into());
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn files(&self) -> usize {
        self.files.load(Ordering::Relaxed)
    }

    pub fn current_file(&self) -> Option<String> {
        self.current_file.lock().ok().and_then(|c| c.clone())
    }
}

/// Point-in-time progress of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub bytes_processed: u64,
    /// Best-effort estimate; `None` while unknown
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    pub elapsed_secs: f64,
    /// Moving average over the tracker window
    pub bytes_per_second: u64,
    pub eta_seconds: Option<u64>,
    /// `MM:SS`, `H:MM:SS`, or `--:--` when indeterminate
    pub eta: String,
    pub speed: String,
    pub current_file: Option<String>,
    pub files_processed: usize,
}

/// Progress tracker with windowed speed calculation
pub struct ProgressTracker {
    job_id: String,
    total_bytes: Option<u64>,
    window: Duration,
    start_time: Instant,
    processed: u64,
    files: usize,
    current_file: Option<String>,
    samples: VecDeque<(Instant, u64)>,
}

impl ProgressTracker {
    /// `total_bytes` of `None` or `Some(0)` means unknown
    pub fn new(job_id: impl Into<String>, total_bytes: Option<u64>, window: Duration) -> Self {
        Self::starting_at(job_id, total_bytes, window, Instant::now())
    }

    pub fn starting_at(job_id: impl Into<String>, total_bytes: Option<u64>, window: Duration, start: Instant) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((start, 0));
        Self {
            job_id: job_id.into(),
            total_bytes: total_bytes.filter(|t| *t > 0),
            window,
            start_time: start,
            processed: 0,
            files: 0,
            current_file: None,
            samples,
        }
    }

    /// Consume one progress event
    pub fn record(&mut self, bytes_delta: u64, file: Option<&str>) {
        self.processed = self.processed.saturating_add(bytes_delta);
        if let Some(file) = file {
            if self.current_file.as_deref() != Some(file) {
                self.current_file = Some(file.to_string());
            }
        }
    }

    pub fn set_files_processed(&mut self, files: usize) {
        self.files = files;
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Take a sample at `now` and build a snapshot
    pub fn snapshot_at(&mut self, now: Instant) -> ProgressSnapshot {
        self.samples.push_back((now, self.processed));
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some((t, _)) if now.duration_since(*t) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }

        let bytes_per_second = match (self.samples.front(), self.samples.back()) {
            (Some((t0, b0)), Some((t1, b1))) => {
                let secs = t1.duration_since(*t0).as_secs_f64();
                if secs > 0.0 {
                    (b1.saturating_sub(*b0) as f64 / secs) as u64
                } else {
                    0
                }
            }
            _ => 0,
        };

        let eta_seconds = match self.total_bytes {
            Some(total) if bytes_per_second > 0 => Some(total.saturating_sub(self.processed) / bytes_per_second),
            _ => None,
        };

        let percent = self
            .total_bytes
            .map(|total| ((self.processed as f64 / total as f64) * 100.0).min(100.0));

        ProgressSnapshot {
            job_id: self.job_id.clone(),
            bytes_processed: self.processed,
            total_bytes: self.total_bytes,
            percent,
            elapsed_secs: now.duration_since(self.start_time).as_secs_f64(),
            bytes_per_second,
            eta_seconds,
            eta: format_eta(eta_seconds),
            speed: format_speed(bytes_per_second),
            current_file: self.current_file.clone(),
            files_processed: self.files,
        }
    }

    pub fn snapshot(&mut self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format an ETA the way the UI shows it
pub fn format_eta(seconds: Option<u64>) -> String {
    match seconds {
        None => "--:--".to_string(),
        Some(s) if s < 3600 => format!("{:02}:{:02}", s / 60, s % 60),
        Some(s) => format!("{}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60),
    }
}
