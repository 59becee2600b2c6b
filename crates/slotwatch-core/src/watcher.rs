//! Change watcher: turns periodic marker reads into "new build" events.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, trace};

use crate::artifact::{read_marker, read_marker_blocking, Marker, MarkerMode};

/// What a poll can report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A new marker has been stable for two consecutive polls.
    Changed(Marker),
    /// The artifact has been missing for this many polls in a row.
    /// Reported once per outage.
    Unreadable {
        /// Polls in a row without an artifact.
        consecutive_misses: u32,
    },
}

/// Polling state for one artifact.
///
/// A marker that differs from the baseline is only a candidate until the next
/// poll sees the exact same marker, so a build still writing the file never
/// fires.
#[derive(Debug)]
pub struct ArtifactWatcher {
    path: PathBuf,
    mode: MarkerMode,
    baseline: Option<Marker>,
    candidate: Option<Marker>,
    misses: u32,
    unreadable_after: u32,
    reported_unreadable: bool,
}

impl ArtifactWatcher {
    /// Captures the current marker as the baseline.
    pub fn new(path: impl Into<PathBuf>, mode: MarkerMode, unreadable_after: u32) -> Self {
        let path = path.into();
        let baseline = read_marker(&path, mode).ok().flatten();
        Self::with_baseline(path, mode, baseline, unreadable_after)
    }

    /// Starts from a known baseline, e.g. the marker the live copy was made from.
    pub fn with_baseline(
        path: impl Into<PathBuf>,
        mode: MarkerMode,
        baseline: Option<Marker>,
        unreadable_after: u32,
    ) -> Self {
        Self {
            path: path.into(),
            mode,
            baseline,
            candidate: None,
            misses: 0,
            unreadable_after: unreadable_after.max(1),
            reported_unreadable: false,
        }
    }

    /// Marker of the last reported build.
    pub fn baseline(&self) -> Option<&Marker> {
        self.baseline.as_ref()
    }

    /// Replaces the baseline and drops any pending candidate.
    pub fn rebase(&mut self, baseline: Option<Marker>) {
        self.baseline = baseline;
        self.candidate = None;
    }

    /// Feeds one observation. `None` means the artifact is missing.
    pub fn observe(&mut self, current: Option<Marker>) -> Option<WatchEvent> {
        let Some(current) = current else {
            self.candidate = None;
            self.misses = self.misses.saturating_add(1);
            if self.misses >= self.unreadable_after && !self.reported_unreadable {
                self.reported_unreadable = true;
                return Some(WatchEvent::Unreadable {
                    consecutive_misses: self.misses,
                });
            }
            return None;
        };

        self.misses = 0;
        self.reported_unreadable = false;

        if self.baseline.as_ref() == Some(&current) {
            self.candidate = None;
            return None;
        }

        if self.candidate.as_ref() == Some(&current) {
            self.candidate = None;
            self.baseline = Some(current.clone());
            return Some(WatchEvent::Changed(current));
        }

        trace!(len = current.len, "artifact changing");
        self.candidate = Some(current);
        None
    }

    /// Reads the artifact and feeds the result to [`observe`](Self::observe).
    pub fn poll(&mut self) -> Option<WatchEvent> {
        let current = read_marker(&self.path, self.mode);
        self.observe_read(current)
    }

    fn observe_read(&mut self, read: std::io::Result<Option<Marker>>) -> Option<WatchEvent> {
        let current = match read {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "artifact metadata unavailable");
                None
            }
        };
        self.observe(current)
    }

    /// Polls on its own task every `period`, forwarding events to `tx`.
    ///
    /// Reads run on the blocking pool. The task ends once the receiving side
    /// is dropped.
    pub fn spawn(mut self, period: Duration, tx: mpsc::Sender<WatchEvent>) -> WatcherHandle {
        let (rebase_tx, mut rebase_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    Some(baseline) = rebase_rx.recv() => {
                        trace!("watcher rebased");
                        self.rebase(baseline);
                        continue;
                    }
                }
                if tx.is_closed() {
                    break;
                }
                let read = read_marker_blocking(&self.path, self.mode).await;
                if let Some(event) = self.observe_read(read) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            debug!(path = %self.path.display(), "watcher stopped");
        });
        WatcherHandle {
            task,
            rebase: rebase_tx,
        }
    }
}

/// Control side of a spawned [`ArtifactWatcher`].
#[derive(Debug)]
pub struct WatcherHandle {
    task: JoinHandle<()>,
    rebase: mpsc::UnboundedSender<Option<Marker>>,
}

impl WatcherHandle {
    /// Makes `baseline` the marker the watcher compares against from its next
    /// poll on, so a build equal to an earlier, not acted-on event fires again.
    pub fn rebase(&self, baseline: Option<Marker>) {
        // a stopped watcher has nothing to rebase
        let _ = self.rebase.send(baseline);
    }

    /// Stops the polling task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the polling task to end.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

/// Waits until two reads one `period` apart return the same marker.
///
/// Gives up after `max_rounds` comparisons and returns `None`.
pub async fn wait_until_stable(
    path: &Path,
    mode: MarkerMode,
    period: Duration,
    max_rounds: u32,
) -> Option<Marker> {
    let mut previous = read_marker_blocking(path, mode).await.ok().flatten();
    for _ in 0..max_rounds {
        sleep(period).await;
        let current = read_marker_blocking(path, mode).await.ok().flatten();
        if current.is_some() && current == previous {
            return current;
        }
        previous = current;
    }
    None
}
