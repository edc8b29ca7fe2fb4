//! Attendance recorder: turns a scan's attendance set into a timestamped
//! record and persists it as a new CSV file.

use crate::types::{AttendanceSet, Identity};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name prefix of persisted records.
pub const RECORD_PREFIX: &str = "Asistencia_Video_";
/// Literal written in the `Present` column.
pub const PRESENT_MARK: &str = "Sí";

const HEADER: [&str; 4] = ["Name", "Date", "Time", "Present"];
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const FILE_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("cannot write attendance record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("no free record name for {0} after {MAX_NAME_ATTEMPTS} attempts")]
    NameExhausted(String),
}

/// One CSV row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRow {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Present")]
    pub present: String,
}

/// Attendance of one completed scan, captured at a single instant.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub captured_at: NaiveDateTime,
    /// Present identities, in lexicographic order.
    pub present: Vec<Identity>,
    /// Size of the enrolled roster at capture time.
    pub known: usize,
}

impl AttendanceRecord {
    /// Record `attendance` stamped with the current local time.
    pub fn new(attendance: &AttendanceSet, known: &BTreeSet<Identity>) -> Self {
        Self::at(attendance, known, Local::now().naive_local())
    }

    /// Record `attendance` stamped with `captured_at`.
    pub fn at(attendance: &AttendanceSet, known: &BTreeSet<Identity>, captured_at: NaiveDateTime) -> Self {
        let strangers: Vec<_> = attendance.difference(known).collect();
        if !strangers.is_empty() {
            tracing::warn!(?strangers, "attendance lists identities missing from the roster");
        }
        Self {
            captured_at,
            present: attendance.iter().cloned().collect(),
            known: known.len(),
        }
    }

    pub fn rows(&self) -> Vec<RecordRow> {
        let date = self.captured_at.format(DATE_FORMAT).to_string();
        let time = self.captured_at.format(TIME_FORMAT).to_string();
        self.present
            .iter()
            .map(|identity| RecordRow {
                name: identity.to_string(),
                date: date.clone(),
                time: time.clone(),
                present: PRESENT_MARK.to_string(),
            })
            .collect()
    }

    /// `Asistencia_Video_<YYYY-MM-DD_HH-MM-SS>.csv`
    pub fn file_name(&self) -> String {
        format!("{RECORD_PREFIX}{}.csv", self.captured_at.format(FILE_STAMP_FORMAT))
    }

    /// Write this record as a new file in `dir` and return its path.
    ///
    /// Never overwrites: if the timestamped name is taken, `_2`, `_3`, …
    /// is appended. A partially written file is removed on failure.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf, PersistenceError> {
        std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let (path, file) = create_unique(dir, &self.file_name())?;
        if let Err(e) = self.write_csv(file) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        tracing::info!(path = %path.display(), present = self.present.len(), "attendance record saved");
        Ok(path)
    }

    fn write_csv(&self, file: File) -> Result<(), PersistenceError> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(HEADER)?;
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|e| PersistenceError::Csv(e.into()))?;
        Ok(())
    }
}

/// Enrolled identities not present in `attendance`.
pub fn absentees(attendance: &AttendanceSet, known: &BTreeSet<Identity>) -> BTreeSet<Identity> {
    known.difference(attendance).cloned().collect()
}

fn create_unique(dir: &Path, file_name: &str) -> Result<(PathBuf, File), PersistenceError> {
    let stem = file_name.trim_end_matches(".csv");
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let path = if attempt == 1 {
            dir.join(file_name)
        } else {
            dir.join(format!("{stem}_{attempt}.csv"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(PersistenceError::Io { path, source }),
        }
    }
    Err(PersistenceError::NameExhausted(file_name.to_string()))
}

/// Persisted records in `dir`, sorted by file name (oldest first).
pub fn list_records(dir: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let is_record = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(RECORD_PREFIX) && n.ends_with(".csv"));
        if is_record && path.is_file() {
            records.push(path);
        }
    }
    records.sort();
    Ok(records)
}

/// Read back the rows of a persisted record.
pub fn read_record(path: &Path) -> Result<Vec<RecordRow>, PersistenceError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    reader
        .deserialize()
        .collect::<Result<Vec<RecordRow>, _>>()
        .map_err(PersistenceError::from)
}
