//! Identity markers for the watched build artifact.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How the artifact's identity is established on each poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerMode {
    /// Size plus modification time. Cheap.
    #[default]
    Mtime,
    /// Size plus a SHA-256 of the bytes. Rewriting identical bytes is not a change.
    Content,
}

/// One observation of the artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    /// File length in bytes.
    pub len: u64,
    /// Modification time, when the platform reports one. Unset in
    /// [`MarkerMode::Content`].
    pub modified: Option<SystemTime>,
    /// Hex SHA-256, only in [`MarkerMode::Content`].
    pub digest: Option<String>,
}

impl Marker {
    /// Builds a marker without touching the filesystem.
    pub fn new(len: u64, modified: Option<SystemTime>) -> Self {
        Self {
            len,
            modified,
            digest: None,
        }
    }
}

/// Reads the marker of `path`.
///
/// `Ok(None)` means the artifact does not exist right now, which the watcher
/// treats as "build in progress" rather than an error.
pub fn read_marker(path: &Path, mode: MarkerMode) -> io::Result<Option<Marker>> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !meta.is_file() {
        return Ok(None);
    }

    let marker = match mode {
        MarkerMode::Mtime => Marker::new(meta.len(), meta.modified().ok()),
        MarkerMode::Content => match hash_file(path) {
            Ok(digest) => Marker {
                len: meta.len(),
                modified: None,
                digest: Some(digest),
            },
            // deleted between metadata and open
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        },
    };
    Ok(Some(marker))
}

/// [`read_marker`] on tokio's blocking pool. Async callers use this, since
/// content mode reads the whole artifact.
pub async fn read_marker_blocking(path: &Path, mode: MarkerMode) -> io::Result<Option<Marker>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_marker(&path, mode))
        .await
        .map_err(io::Error::other)?
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
