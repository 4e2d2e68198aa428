// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local journal standing in for the network in offline mode.
//!
//! Each run owns a directory below the journal root named after its local
//! uid. It holds `run.json` (the creation payload), zero-byte marker files
//! whose presence and mtime encode the run status, and one file per record
//! named `{prefix}-{unix seconds}` (`.json` for JSON payloads). A sweep
//! renames a record with a `-proc` suffix once it has been delivered.

use crate::error::JournalError;
use crate::transport::{Payload, RecordKind};
use filetime::FileTime;
use serde_json::Value;
use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const RUN_FILE: &str = "run.json";
pub const PROCESSED_SUFFIX: &str = "-proc";
const JSON_EXTENSION: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Created,
    Running,
    Completed,
    Failed,
    Terminated,
    Lost,
    Sent,
    Heartbeat,
}

impl Marker {
    pub const ALL: [Marker; 8] = [
        Marker::Created,
        Marker::Running,
        Marker::Completed,
        Marker::Failed,
        Marker::Terminated,
        Marker::Lost,
        Marker::Sent,
        Marker::Heartbeat,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Marker::Created => "created",
            Marker::Running => "running",
            Marker::Completed => "completed",
            Marker::Failed => "failed",
            Marker::Terminated => "terminated",
            Marker::Lost => "lost",
            Marker::Sent => "sent",
            Marker::Heartbeat => "heartbeat",
        }
    }

    /// Marker written for a run status string found in an update.
    pub fn from_status(status: &str) -> Option<Self> {
        Marker::ALL
            .into_iter()
            .find(|marker| marker.file_name() == status && *marker != Marker::Heartbeat)
    }

    /// Statuses after which the run produces no more records.
    pub fn is_finished(self) -> bool {
        matches!(self, Marker::Completed | Marker::Failed | Marker::Terminated)
    }

    pub fn is_terminal(self) -> bool {
        self.is_finished() || self == Marker::Lost
    }
}

/// An unprocessed record file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    pub path: PathBuf,
    pub kind: RecordKind,
    pub modified: SystemTime,
}

impl RecordFile {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    /// Creation timestamp encoded in the file name
    fn stamp(&self) -> f64 {
        parse_record_name(self.file_name()).map_or(0.0, |(_, stamp)| stamp)
    }
}

fn parse_record_name(name: &str) -> Option<(RecordKind, f64)> {
    let (prefix, rest) = name.split_once('-')?;
    let kind = RecordKind::from_prefix(prefix)?;
    let stamp = rest.strip_suffix(JSON_EXTENSION).unwrap_or(rest);
    Some((kind, stamp.parse().ok()?))
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Journal directory of a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunJournal {
    dir: PathBuf,
}

impl RunJournal {
    /// Opens the directory for `uid` below `root`, creating it if needed.
    pub fn create(root: &Path, uid: &str) -> Result<Self, JournalError> {
        let dir = root.join(uid);
        fs::create_dir_all(&dir).map_err(|e| JournalError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn uid(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn write_run(&self, data: &Value) -> Result<(), JournalError> {
        let bytes = serde_json::to_vec(data).map_err(|e| JournalError::Malformed {
            path: self.dir.join(RUN_FILE),
            message: e.to_string(),
        })?;
        self.write_atomic(RUN_FILE, &bytes)
    }

    pub fn read_run(&self) -> Result<Value, JournalError> {
        let path = self.dir.join(RUN_FILE);
        let bytes = fs::read(&path).map_err(|e| JournalError::io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| JournalError::Malformed {
            path,
            message: e.to_string(),
        })
    }

    pub fn run_modified(&self) -> Result<SystemTime, JournalError> {
        let path = self.dir.join(RUN_FILE);
        fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .map_err(|e| JournalError::io(&path, e))
    }

    /// Persists one record, returning its path.
    ///
    /// The name encodes the current time with microsecond resolution; on a
    /// collision the stamp is bumped until the name is free.
    pub fn write_record(&self, kind: RecordKind, payload: &Payload) -> Result<PathBuf, JournalError> {
        let (bytes, extension) = match payload {
            Payload::Binary(bytes) => (bytes.clone(), ""),
            Payload::Json(value) => (
                serde_json::to_vec(value).map_err(|e| JournalError::Malformed {
                    path: self.dir.clone(),
                    message: e.to_string(),
                })?,
                JSON_EXTENSION,
            ),
        };

        let mut stamp = unix_seconds(SystemTime::now());
        let mut name = format!("{}-{stamp:.6}{extension}", kind.prefix());
        while self.dir.join(&name).exists()
            || self.dir.join(format!("{name}{PROCESSED_SUFFIX}")).exists()
        {
            stamp += 0.000_001;
            name = format!("{}-{stamp:.6}{extension}", kind.prefix());
        }

        self.write_atomic(&name, &bytes)?;
        Ok(self.dir.join(name))
    }

    pub fn read_record(&self, record: &RecordFile) -> Result<Payload, JournalError> {
        let bytes = fs::read(&record.path).map_err(|e| JournalError::io(&record.path, e))?;
        if record.file_name().ends_with(JSON_EXTENSION) {
            let value = serde_json::from_slice(&bytes).map_err(|e| JournalError::Malformed {
                path: record.path.clone(),
                message: e.to_string(),
            })?;
            Ok(Payload::Json(value))
        } else {
            Ok(Payload::Binary(bytes))
        }
    }

    /// Records not yet processed, oldest modification time first.
    pub fn pending_records(&self) -> Result<Vec<RecordFile>, JournalError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| JournalError::io(&self.dir, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| JournalError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(PROCESSED_SUFFIX) {
                continue;
            }
            let Some((kind, _)) = parse_record_name(&name) else {
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|e| JournalError::io(entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map_err(|e| JournalError::io(entry.path(), e))?;
            records.push(RecordFile {
                path: entry.path(),
                kind,
                modified,
            });
        }

        records.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.stamp().partial_cmp(&b.stamp()).unwrap_or(Ordering::Equal))
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(records)
    }

    pub fn mark_processed(&self, record: &RecordFile) -> Result<(), JournalError> {
        let mut target = record.path.clone().into_os_string();
        target.push(PROCESSED_SUFFIX);
        fs::rename(&record.path, &target).map_err(|e| JournalError::io(&record.path, e))
    }

    /// Creates `marker`, or refreshes its mtime when it already exists.
    pub fn touch(&self, marker: Marker) -> Result<(), JournalError> {
        let path = self.dir.join(marker.file_name());
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;
        filetime::set_file_mtime(&path, FileTime::now()).map_err(|e| JournalError::io(&path, e))
    }

    pub fn remove(&self, marker: Marker) -> Result<(), JournalError> {
        let path = self.dir.join(marker.file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JournalError::io(&path, e)),
        }
    }

    pub fn has(&self, marker: Marker) -> bool {
        self.dir.join(marker.file_name()).is_file()
    }

    pub fn modified(&self, marker: Marker) -> Option<SystemTime> {
        fs::metadata(self.dir.join(marker.file_name()))
            .and_then(|metadata| metadata.modified())
            .ok()
    }

    /// Status marker a sweep acts upon, finished states first.
    pub fn sweep_status(&self) -> Option<Marker> {
        [
            Marker::Completed,
            Marker::Failed,
            Marker::Terminated,
            Marker::Running,
        ]
        .into_iter()
        .find(|marker| self.has(*marker))
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), JournalError> {
        let temp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);
        fs::write(&temp, bytes).map_err(|e| JournalError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| JournalError::io(&path, e))
    }
}

/// Run directories below `root` carrying a running or finished marker,
/// ordered by uid.
pub fn runs_to_sweep(root: &Path) -> Result<Vec<(RunJournal, Marker)>, JournalError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(JournalError::io(root, e)),
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| JournalError::io(root, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let journal = RunJournal::open(entry.path());
        if let Some(status) = journal.sweep_status() {
            runs.push((journal, status));
        }
    }
    runs.sort_by(|a, b| a.0.dir.cmp(&b.0.dir));
    Ok(runs)
}
