//! Append-only JSONL persistence for ledger records.
//!
//! Records are written one JSON object per line into monthly files named
//! `usage-YYYY-MM.jsonl`. Past months can be moved into `archive/`.

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::record::LedgerRecord;

const FILE_PREFIX: &str = "usage-";
const FILE_SUFFIX: &str = ".jsonl";
const ARCHIVE_DIR: &str = "archive";

/// Errors from the ledger store.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode ledger record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Ledger file {path} is corrupt at line {line}: {reason}")]
    Corruption {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Records recovered at startup.
#[derive(Debug, Default)]
pub struct LoadedLedger {
    pub records: Vec<LedgerRecord>,

    /// Set when the month file was unreadable and was quarantined
    pub quarantined: Option<PathBuf>,
}

/// Monthly-rotated JSONL ledger on disk.
#[derive(Debug)]
pub struct LedgerStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LedgerStore {
    /// Open (and create if needed) a ledger directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Ledger directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding records for the month of `at`.
    pub fn file_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(month_file_name(at.year(), at.month()))
    }

    /// Append one record to its month file.
    pub fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(record.timestamp))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every record of the month containing `at`.
    pub fn load_month(&self, at: DateTime<Utc>) -> Result<Vec<LedgerRecord>, LedgerError> {
        let path = self.file_for(at);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_records(&path)
    }

    /// Load the current month for startup.
    ///
    /// A corrupt file is renamed aside and an empty ledger is returned, so
    /// the service starts with zeroed windows instead of refusing to start.
    pub fn load_current(&self, now: DateTime<Utc>) -> Result<LoadedLedger, LedgerError> {
        match self.load_month(now) {
            Ok(records) => Ok(LoadedLedger {
                records,
                quarantined: None,
            }),
            Err(LedgerError::Corruption { path, line, reason }) => {
                let quarantine = path.with_extension(format!("jsonl.corrupt-{}", now.timestamp()));
                fs::rename(&path, &quarantine)?;
                tracing::error!(
                    path = %path.display(),
                    quarantined_to = %quarantine.display(),
                    line,
                    reason = %reason,
                    "LEDGER CORRUPTION: starting from a fresh, zeroed ledger"
                );
                Ok(LoadedLedger {
                    records: Vec::new(),
                    quarantined: Some(quarantine),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Move month files older than the month of `now` into `archive/`.
    pub fn archive_before(&self, now: DateTime<Utc>) -> Result<Vec<PathBuf>, LedgerError> {
        let current = (now.year(), now.month());
        let archive = self.dir.join(ARCHIVE_DIR);
        let mut moved = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(month) = path.file_name().and_then(|n| n.to_str()).and_then(parse_month) else {
                continue;
            };
            if month >= current {
                continue;
            }
            fs::create_dir_all(&archive)?;
            let target = archive.join(month_file_name(month.0, month.1));
            fs::rename(&path, &target)?;
            tracing::info!(from = %path.display(), to = %target.display(), "Archived ledger month");
            moved.push(target);
        }

        moved.sort();
        Ok(moved)
    }
}

fn read_records(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LedgerError::Corruption {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| LedgerError::Corruption {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        records.push(record);
    }

    Ok(records)
}

fn month_file_name(year: i32, month: u32) -> String {
    format!("{FILE_PREFIX}{year:04}-{month:02}{FILE_SUFFIX}")
}

fn parse_month(name: &str) -> Option<(i32, u32)> {
    let stem = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (year, month) = stem.split_once('-')?;
    Some((year.parse().ok()?, month.parse().ok()?))
}
