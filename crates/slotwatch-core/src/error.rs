//! Error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

/// Everything the supervisor and its parts can fail with.
#[derive(Debug, Error)]
pub enum SlotwatchError {
    /// Duplicating the artifact into a slot failed.
    #[error("copy {} -> {} failed: {source}", artifact.display(), slot.display())]
    CopyFailed {
        /// Artifact being copied.
        artifact: PathBuf,
        /// Slot being written.
        slot: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact has been missing for many consecutive polls.
    #[error("artifact {} unreadable for {consecutive_misses} consecutive polls", path.display())]
    ArtifactUnreadable {
        /// Watched artifact path.
        path: PathBuf,
        /// Number of polls in a row that found nothing.
        consecutive_misses: u32,
    },

    /// The target could not be started from a slot.
    #[error("launch of {} failed: {source}", program.display())]
    LaunchFailed {
        /// Slot path that was executed.
        program: PathBuf,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The state record exists but does not parse.
    #[error("state record {} is corrupt: {reason}", path.display())]
    StateLoadCorrupt {
        /// State file path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// An instance survived both the stop request and the forced kill.
    #[error("instance {generation} survived stop request and forced kill ({waited_ms}ms)")]
    TerminationTimeout {
        /// Launch sequence number of the stuck instance.
        generation: u64,
        /// Total time spent waiting.
        waited_ms: u128,
    },

    /// A retried step never succeeded.
    #[error("{what} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Step name, e.g. `"copy"`.
        what: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Box<SlotwatchError>,
    },

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// I/O outside the copy and launch paths.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of a state record.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SlotwatchError {
    /// True for the conditions the supervisor may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CopyFailed { .. } | Self::LaunchFailed { .. })
    }
}

/// Crate result alias.
pub type Result<T, E = SlotwatchError> = std::result::Result<T, E>;
