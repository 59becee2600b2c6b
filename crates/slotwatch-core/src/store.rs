//! State handoff store: the one record that survives a relaunch.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, SlotwatchError};

/// Result of reading the record, with the "why not" kept.
#[derive(Debug, PartialEq)]
pub enum LoadOutcome<T> {
    /// The record parsed.
    Loaded(T),
    /// No record has been written yet.
    Missing,
    /// A record exists but could not be read or parsed.
    Corrupt(String),
}

/// A single JSON record at a fixed path.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers see either the previous record or the new one.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by `path`. Nothing is touched until the first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the record.
    pub fn save<T: Serialize>(&self, record: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        self.save_bytes(&bytes)
    }

    /// Atomically replaces the record with raw bytes.
    pub fn save_bytes(&self, bytes: &[u8]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| SlotwatchError::Io(e.error))?;
        Ok(())
    }

    /// Reads the record; `None` for both "never written" and "unreadable".
    ///
    /// A corrupt record is logged as a warning before being treated as absent.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match self.load_outcome() {
            LoadOutcome::Loaded(v) => Some(v),
            LoadOutcome::Missing => None,
            LoadOutcome::Corrupt(reason) => {
                let err = SlotwatchError::StateLoadCorrupt {
                    path: self.path.clone(),
                    reason,
                };
                warn!(error = %err, "ignoring prior state");
                None
            }
        }
    }

    /// Reads the record and reports which case applied.
    pub fn load_outcome<T: DeserializeOwned>(&self) -> LoadOutcome<T> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return LoadOutcome::Missing,
            Err(e) => return LoadOutcome::Corrupt(e.to_string()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => LoadOutcome::Loaded(v),
            Err(e) => LoadOutcome::Corrupt(e.to_string()),
        }
    }

    /// Deletes the record. Clearing an absent record succeeds.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
