//! Crash report storage
//!
//! Each confirmed capture is written as one pretty-printed JSON file named
//! `crash-<unix secs>-<pid>.json` inside the report directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crashwrap_core::Capture;

const PREFIX: &str = "crash-";
const EXTENSION: &str = ".json";

/// Report errors
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid report data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Report directory not found")]
    NoReportDir,
}

/// One captured crash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Program that crashed
    pub program: String,
    /// Its arguments
    pub args: Vec<String>,
    /// PID of the supervisor that captured the output
    pub supervisor_pid: u32,
    /// Unix timestamp of the capture
    pub captured_at: u64,
    /// Payload exit status (`128 + signal` for a signal death)
    pub exit_status: i32,
    /// Captured crash output
    pub text: String,
}

impl CrashReport {
    /// Build a report for a capture taken by this process
    pub fn new(program: impl Into<String>, args: Vec<String>, capture: &Capture) -> Self {
        Self {
            program: program.into(),
            args,
            supervisor_pid: std::process::id(),
            captured_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            exit_status: capture.exit_status(),
            text: capture.text().into_owned(),
        }
    }

    /// File name this report is stored under
    pub fn file_name(&self) -> String {
        format!(
            "{}{}-{}{}",
            PREFIX, self.captured_at, self.supervisor_pid, EXTENSION
        )
    }

    /// First line of the crash output
    pub fn headline(&self) -> &str {
        self.text
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
    }

    /// One-line description for listings
    pub fn summary(&self) -> String {
        format!(
            "{} (exit {}): {}",
            self.program,
            self.exit_status,
            self.headline()
        )
    }
}

/// Default report directory
pub fn default_report_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "crashwrap", "crashwrap")
        .map(|dirs| dirs.data_dir().join("reports"))
}

/// Sort key from a report file name: (timestamp, collision index)
fn report_key(name: &str) -> Option<(u64, u32)> {
    let stem = name.strip_prefix(PREFIX)?.strip_suffix(EXTENSION)?;
    let mut parts = stem.split('-');
    let secs = parts.next()?.parse().ok()?;
    let _pid: u32 = parts.next()?.parse().ok()?;
    let index = match parts.next() {
        Some(n) => n.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((secs, index))
}

/// Free path for `report` in `dir`
fn unique_path(dir: &Path, report: &CrashReport) -> PathBuf {
    let path = dir.join(report.file_name());
    if !path.exists() {
        return path;
    }

    let mut index = 1u32;
    loop {
        let path = dir.join(format!(
            "{}{}-{}-{}{}",
            PREFIX, report.captured_at, report.supervisor_pid, index, EXTENSION
        ));
        if !path.exists() {
            return path;
        }
        index += 1;
    }
}

/// Write a report into `dir`, returning its path
pub fn write_report(dir: &Path, report: &CrashReport) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(dir)?;

    let bytes = serde_json::to_vec_pretty(report)?;
    let path = unique_path(dir, report);

    // Write atomically using temp file + rename
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &bytes)?;

    // Crash output may contain secrets
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&temp_path, perms)?;
    }

    fs::rename(&temp_path, &path)?;

    log::trace!("Wrote crash report {}: {} bytes", path.display(), bytes.len());

    Ok(path)
}

/// Read a report from disk
pub fn read_report(path: &Path) -> Result<CrashReport, ReportError> {
    let bytes = fs::read(path)?;
    let report = serde_json::from_slice(&bytes)?;
    Ok(report)
}

/// Report files in `dir`, newest first; a missing directory has none
pub fn list_reports(dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut reports = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(key) = name.to_str().and_then(report_key) else {
            continue;
        };
        reports.push((key, entry.path()));
    }

    reports.sort_by(|(a_key, a_path), (b_key, b_path)| {
        b_key.cmp(a_key).then_with(|| b_path.cmp(a_path))
    });
    Ok(reports.into_iter().map(|(_, path)| path).collect())
}

/// The newest report in `dir`
pub fn latest_report(dir: &Path) -> Result<Option<PathBuf>, ReportError> {
    Ok(list_reports(dir)?.into_iter().next())
}

/// Delete all but the `keep` newest reports; 0 keeps everything
///
/// Returns the number of reports removed.
pub fn prune_reports(dir: &Path, keep: usize) -> Result<usize, ReportError> {
    if keep == 0 {
        return Ok(0);
    }

    let mut removed = 0;
    for path in list_reports(dir)?.into_iter().skip(keep) {
        // Check for symlink to prevent targeted file deletion
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_symlink() {
            log::warn!("Report {} is a symlink, refusing to remove", path.display());
            continue;
        }
        fs::remove_file(&path)?;
        removed += 1;
    }

    if removed > 0 {
        log::debug!("Pruned {} old crash reports from {}", removed, dir.display());
    }
    Ok(removed)
}
