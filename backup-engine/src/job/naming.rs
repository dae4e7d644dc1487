//! Artifact and job naming.

use chrono::{DateTime, TimeZone};
use std::path::Path;

use super::Encryption;

const ARCHIVE_SUFFIX: &str = ".tar.zst";

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `<DD_MON>_BACKUP`, e.g. `07_MAR_BACKUP`
pub fn default_job_name<Tz: TimeZone>(now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}_BACKUP", now.format("%d_%b").to_string().to_uppercase())
}

pub fn artifact_file_name(name: &str, encryption: Encryption) -> String {
    let mut file_name = format!("{}{}", sanitize_name(name), ARCHIVE_SUFFIX);
    match encryption {
        Encryption::None => {}
        Encryption::Age => file_name.push_str(".age"),
        Encryption::Gpg => file_name.push_str(".gpg"),
    }
    file_name
}

/// Name of one split unit's archive
pub fn split_unit_name(job_name: &str, subdir: &str) -> String {
    format!("{}_{}", sanitize_name(job_name), sanitize_name(subdir))
}

/// Decryptor implied by an archive's extension
pub fn infer_encryption(archive: &Path) -> Encryption {
    match archive.extension().and_then(|e| e.to_str()) {
        Some("age") => Encryption::Age,
        Some("gpg") => Encryption::Gpg,
        _ => Encryption::None,
    }
}
