//! JSONL activity log: one self-contained JSON object per line.
//!
//! Lines are assembled in memory and written with a single `write_all`, so a
//! concurrent `tail -f` never sees a partial line.
//!
//! Degradation chain:
//! 1. Primary file path
//! 2. Fallback path (`/dev/shm/cbh.jsonl`, RAM-backed)
//! 3. stderr with `[CBH-JSONL]` prefix
//! 4. Silent discard (container operations never fail because of logging)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::errors::{CbhError, Result};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Container lifecycle and ballast events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ContainerRun,
    ContainerStart,
    ContainerStop,
    ContainerRemove,
    BallastAllocate,
    BallastShrink,
    DiagnosticFailure,
    Error,
}

/// A single JSONL log entry; everything but `ts`, `event` and `severity` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Container name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Ballast size in bytes after the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Ballast size in bytes before the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_gb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_gb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// CBH error code if the action failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            container: None,
            size: None,
            previous_size: None,
            used_gb: None,
            capacity_gb: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn container(mut self, name: &str) -> Self {
        self.container = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn ok(mut self, ok: bool) -> Self {
        self.ok = Some(ok);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Record a failure: sets `ok = false`, the error code and its message.
    #[must_use]
    pub fn failure(mut self, err: &CbhError) -> Self {
        self.ok = Some(false);
        self.error_code = Some(err.code().to_string());
        self.error_message = Some(err.to_string());
        self
    }
}

/// Degradation state of the JSONL writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Optional fallback path, ideally on a different filesystem.
    pub fallback_path: Option<PathBuf>,
    /// Maximum file size before rotation (bytes). Default: 10 MiB.
    pub max_size_bytes: u64,
    /// Number of rotated files to keep. Default: 3.
    pub max_rotated_files: u32,
    /// Seconds between forced fsync calls. Default: 10.
    pub fsync_interval_secs: u64,
}

impl JsonlConfig {
    /// Defaults around a caller-chosen primary path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("activity.jsonl"),
            fallback_path: Some(PathBuf::from("/dev/shm/cbh.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval_secs: 10,
        }
    }
}

/// Append-only JSONL writer with size-capped rotation and fallback.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: SystemTime,
}

impl JsonlWriter {
    /// Open the log. Never fails: an unusable path moves down the chain.
    pub fn open(config: JsonlConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        };
        let primary = w.config.path.clone();
        if !w.attach(&primary, WriterState::Normal) {
            w.fall_back("primary path unusable");
        }
        w
    }

    /// Append one entry as a single line.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[CBH-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    /// Flush and sync data to disk.
    pub fn fsync(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
        self.last_fsync = SystemTime::now();
    }

    /// Current degradation state.
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Bytes in the current file, including what was there at open.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    // ──────────────────────── internals ────────────────────────

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.writer.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }

        loop {
            match self.state {
                WriterState::Normal | WriterState::Fallback => {
                    let written = self
                        .writer
                        .as_mut()
                        .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                    if written {
                        self.bytes_written += len;
                        self.maybe_fsync();
                        return;
                    }
                    self.degrade();
                }
                WriterState::Stderr => {
                    if write!(io::stderr(), "[CBH-JSONL] {line}").is_err() {
                        self.state = WriterState::Discard;
                    }
                    return;
                }
                WriterState::Discard => return,
            }
        }
    }

    fn maybe_fsync(&mut self) {
        let elapsed = SystemTime::now()
            .duration_since(self.last_fsync)
            .unwrap_or(Duration::ZERO);
        if elapsed.as_secs() >= self.config.fsync_interval_secs {
            self.fsync();
        }
    }

    /// Point the writer at `path`; false if it cannot be opened.
    fn attach(&mut self, path: &Path, state: WriterState) -> bool {
        match open_append(path) {
            Ok((file, size)) => {
                self.writer = Some(BufWriter::with_capacity(16 * 1024, file));
                self.state = state;
                self.bytes_written = size;
                true
            }
            Err(_) => false,
        }
    }

    fn fall_back(&mut self, reason: &str) {
        self.writer = None;
        if let Some(fb) = self.config.fallback_path.clone()
            && self.attach(&fb, WriterState::Fallback)
        {
            let _ = writeln!(
                io::stderr(),
                "[CBH-JSONL] {reason}, using fallback: {}",
                fb.display()
            );
            return;
        }
        self.state = WriterState::Stderr;
        let _ = writeln!(io::stderr(), "[CBH-JSONL] {reason}, using stderr");
    }

    fn degrade(&mut self) {
        match self.state {
            WriterState::Normal => self.fall_back("primary write failed"),
            WriterState::Fallback => {
                self.writer = None;
                self.state = WriterState::Stderr;
                let _ = writeln!(io::stderr(), "[CBH-JSONL] fallback write failed, using stderr");
            }
            WriterState::Stderr | WriterState::Discard => {
                self.writer = None;
                self.state = WriterState::Discard;
            }
        }
    }

    /// `log.jsonl` → `log.jsonl.1` → … → `log.jsonl.N`, oldest dropped.
    fn rotate(&mut self) {
        let base = match self.state {
            WriterState::Normal => self.config.path.clone(),
            WriterState::Fallback => match self.config.fallback_path.clone() {
                Some(p) => p,
                None => return,
            },
            WriterState::Stderr | WriterState::Discard => return,
        };
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        if keep > 0 {
            let _ = rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        let state = self.state;
        if !self.attach(&base, state) {
            self.degrade();
        }
    }
}

// ──────────────────────── helpers ────────────────────────

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| CbhError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| CbhError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
