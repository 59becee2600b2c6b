//! Slot-rotating copier.
//!
//! The build system overwrites the artifact in place, and some platforms
//! refuse to overwrite an executable that is running. Instances are therefore
//! never run from the artifact itself but from one of a few slot copies, and
//! a fresh copy always lands in a slot that no live instance was started from.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SlotwatchError};

/// Index of a slot within its rotator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0 + 1)
    }
}

/// Copies `artifact` into the first of `candidates` that is not `previous`.
///
/// The bytes go to a `.partial` sibling first and are renamed over the slot,
/// so the slot path only ever holds a complete executable.
pub fn obtain_copy(
    artifact: &Path,
    candidates: &[PathBuf],
    previous: Option<SlotId>,
) -> Result<(PathBuf, SlotId)> {
    let (index, slot) = candidates
        .iter()
        .enumerate()
        .find(|(i, _)| Some(SlotId(*i)) != previous)
        .ok_or_else(|| SlotwatchError::Config("no free copy slot".into()))?;

    let copy_failed = |source| SlotwatchError::CopyFailed {
        artifact: artifact.to_path_buf(),
        slot: slot.clone(),
        source,
    };

    if let Some(parent) = slot.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(copy_failed)?;
    }

    let staging = staging_path(slot);
    let bytes = std::fs::copy(artifact, &staging).map_err(|e| {
        let _ = std::fs::remove_file(&staging);
        copy_failed(e)
    })?;
    std::fs::rename(&staging, slot).map_err(|e| {
        let _ = std::fs::remove_file(&staging);
        copy_failed(e)
    })?;

    debug!(slot = %slot.display(), bytes, "artifact copied");
    Ok((slot.clone(), SlotId(index)))
}

fn staging_path(slot: &Path) -> PathBuf {
    let mut name: OsString = slot.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    slot.with_file_name(name)
}

/// Derives `count` slot paths from a hint by suffixing the file stem.
///
/// `target/app_copy.exe` becomes `target/app_copy-1.exe`, `target/app_copy-2.exe`, ...
pub fn slots_from_hint(hint: &Path, count: usize) -> Vec<PathBuf> {
    let stem = hint
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "slot".to_string());
    let ext = hint.extension().map(|e| e.to_string_lossy().into_owned());

    (1..=count)
        .map(|i| {
            let name = match &ext {
                Some(ext) => format!("{stem}-{i}.{ext}"),
                None => format!("{stem}-{i}"),
            };
            hint.with_file_name(name)
        })
        .collect()
}

/// A fixed set of slots plus the copy operation.
#[derive(Clone, Debug)]
pub struct SlotRotator {
    slots: Vec<PathBuf>,
}

impl SlotRotator {
    /// Requires at least two slots, otherwise the live slot could be overwritten.
    pub fn new(slots: Vec<PathBuf>) -> Result<Self> {
        if slots.len() < 2 {
            return Err(SlotwatchError::Config(format!(
                "at least two copy slots are required, got {}",
                slots.len()
            )));
        }
        Ok(Self { slots })
    }

    /// Rotates `artifact` into a slot other than `live`.
    pub fn obtain_copy(&self, artifact: &Path, live: Option<SlotId>) -> Result<(PathBuf, SlotId)> {
        obtain_copy(artifact, &self.slots, live)
    }
}
