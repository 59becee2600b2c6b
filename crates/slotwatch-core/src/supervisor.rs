//! Relaunch supervisor.
//!
//! Owns the single live instance. Watches the artifact on a separate task,
//! and on every settled rebuild copies it into a free slot, stops the old
//! instance (stop request, grace period, forced kill) and starts the new copy
//! in resume mode with the same state path. The next instance is never
//! started before the previous one has exited, so only one process at a time
//! writes the state record.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::artifact::Marker;
use crate::config::Config;
use crate::error::{Result, SlotwatchError};
use crate::process::{LaunchMode, LaunchRequest, Launcher, ProcessHandle};
use crate::slots::{SlotId, SlotRotator};
use crate::watcher::{wait_until_stable, ArtifactWatcher, WatchEvent};

const EVENT_BUFFER: usize = 16;

/// Where the supervisor is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Making the first copy and launching it.
    Starting,
    /// One instance is live; waiting for a rebuild.
    Running {
        /// Launch sequence number of the live instance.
        generation: u64,
        /// Slot it runs from.
        slot: SlotId,
    },
    /// Replacing the instance that runs from `from`.
    Rotating {
        /// Slot of the instance being replaced.
        from: SlotId,
    },
    /// Done; `run` is returning.
    Terminated,
}

/// Counters returned after a clean stop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Instances started, including the first.
    pub launches: u64,
    /// Completed rotations.
    pub rotations: u64,
    /// Change events folded into a later rotation.
    pub coalesced: u64,
}

struct Instance<H> {
    handle: H,
    slot: SlotId,
    generation: u64,
    marker: Option<Marker>,
    exit_noticed: bool,
}

enum Flow {
    Continue,
    Shutdown,
}

/// Where a path points on disk, for comparing paths that may not exist yet.
///
/// An existing file resolves through symlinks. Otherwise the parent directory
/// is resolved and the file name kept, and a path whose parent is missing too
/// is kept as written.
#[derive(Debug, PartialEq, Eq, Hash)]
struct FileLocation(PathBuf);

impl FileLocation {
    fn of(path: &Path) -> Self {
        if let Ok(resolved) = std::fs::canonicalize(path) {
            return Self(resolved);
        }
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        match (std::fs::canonicalize(parent), path.file_name()) {
            (Ok(dir), Some(name)) => Self(dir.join(name)),
            _ => Self(path.to_path_buf()),
        }
    }
}

/// Watch-and-relaunch state machine over a [`Launcher`].
pub struct Supervisor<L: Launcher> {
    artifact: PathBuf,
    state_path: PathBuf,
    rotator: SlotRotator,
    config: Config,
    launcher: L,
    phase: Phase,
    generation: u64,
    summary: RunSummary,
}

impl<L: Launcher> Supervisor<L> {
    /// Validates the configuration and the slot set.
    ///
    /// Slots must be distinct and must not be the artifact itself.
    pub fn new(
        artifact: impl Into<PathBuf>,
        slots: Vec<PathBuf>,
        state_path: impl Into<PathBuf>,
        config: Config,
        launcher: L,
    ) -> Result<Self> {
        config.validate()?;
        let artifact = artifact.into();

        let artifact_location = FileLocation::of(&artifact);
        let mut seen = HashSet::new();
        for slot in &slots {
            let location = FileLocation::of(slot);
            if location == artifact_location {
                return Err(SlotwatchError::Config(format!(
                    "copy slot {} is the artifact itself",
                    slot.display()
                )));
            }
            if !seen.insert(location) {
                return Err(SlotwatchError::Config(format!(
                    "copy slot {} listed twice",
                    slot.display()
                )));
            }
        }

        Ok(Self {
            artifact,
            state_path: state_path.into(),
            rotator: SlotRotator::new(slots)?,
            config,
            launcher,
            phase: Phase::Starting,
            generation: 0,
            summary: RunSummary::default(),
        })
    }

    /// Current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The launcher, e.g. to inspect a test double after `run`.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Path handed to every instance.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Runs until `shutdown` resolves or a fatal error occurs.
    ///
    /// On shutdown the live instance is stopped before returning. On a fatal
    /// copy or launch failure the live instance, if any, is left running.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.set_phase(Phase::Starting);

        let mut live = match self.start(&mut shutdown).await {
            Ok(Some(live)) => live,
            Ok(None) => {
                info!("stop requested before the first launch");
                self.set_phase(Phase::Terminated);
                return Ok(self.summary);
            }
            Err(e) => {
                error!(error = %e, "could not start the first instance");
                self.set_phase(Phase::Terminated);
                return Err(e);
            }
        };

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let watcher = ArtifactWatcher::with_baseline(
            &self.artifact,
            self.config.marker,
            live.marker.clone(),
            self.config.unreadable_after_polls,
        )
        .spawn(self.config.poll_interval(), tx);

        let mut health = interval(self.config.poll_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("stop requested");
                    break Ok(());
                }
                event = rx.recv() => match event {
                    Some(WatchEvent::Changed(marker)) => {
                        debug!(len = marker.len, "artifact changed");
                        match self.rotate(&mut live, &mut rx, &mut shutdown).await {
                            // compare against what is actually running, whether
                            // or not this event led to a relaunch
                            Ok(Flow::Continue) => watcher.rebase(live.marker.clone()),
                            Ok(Flow::Shutdown) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(WatchEvent::Unreadable { consecutive_misses }) => {
                        let err = SlotwatchError::ArtifactUnreadable {
                            path: self.artifact.clone(),
                            consecutive_misses,
                        };
                        warn!(error = %err, "still waiting for the artifact");
                    }
                    None => {
                        let err = std::io::Error::other("watcher task ended");
                        break Err(SlotwatchError::Io(err));
                    }
                },
                _ = health.tick() => {
                    if !live.exit_noticed && !live.handle.is_alive() {
                        live.exit_noticed = true;
                        info!(
                            generation = live.generation,
                            "instance exited on its own; waiting for the next build"
                        );
                    }
                }
            }
        };

        watcher.abort();

        let outcome = match outcome {
            Ok(()) => self.stop_instance(&mut live).await,
            Err(e) => Err(e),
        };
        self.set_phase(Phase::Terminated);

        match outcome {
            Ok(()) => {
                info!(
                    launches = self.summary.launches,
                    rotations = self.summary.rotations,
                    "supervisor stopped"
                );
                Ok(self.summary)
            }
            Err(e) => {
                error!(error = %e, "supervisor giving up");
                Err(e)
            }
        }
    }

    async fn start<F>(&mut self, shutdown: &mut Pin<&mut F>) -> Result<Option<Instance<L::Handle>>>
    where
        F: Future<Output = ()>,
    {
        let settled = tokio::select! {
            m = self.settle() => m,
            _ = shutdown.as_mut() => return Ok(None),
        };
        if settled.is_none() {
            warn!(
                artifact = %self.artifact.display(),
                "artifact not stable at startup; copying anyway"
            );
        }

        let (path, slot) = tokio::select! {
            r = self.copy_into_free_slot(None) => r?,
            _ = shutdown.as_mut() => return Ok(None),
        };

        let mode = if self.config.launch.resume_on_start {
            LaunchMode::Resume
        } else {
            LaunchMode::Initialize
        };
        tokio::select! {
            r = self.launch(path, slot, mode, settled) => r.map(Some),
            _ = shutdown.as_mut() => Ok(None),
        }
    }

    async fn rotate<F>(
        &mut self,
        live: &mut Instance<L::Handle>,
        rx: &mut mpsc::Receiver<WatchEvent>,
        shutdown: &mut Pin<&mut F>,
    ) -> Result<Flow>
    where
        F: Future<Output = ()>,
    {
        self.set_phase(Phase::Rotating { from: live.slot });

        while let Ok(event) = rx.try_recv() {
            if let WatchEvent::Changed(_) = event {
                self.summary.coalesced += 1;
            }
        }

        let settled = tokio::select! {
            m = self.settle() => m,
            _ = shutdown.as_mut() => return Ok(Flow::Shutdown),
        };
        let Some(settled) = settled else {
            warn!(
                artifact = %self.artifact.display(),
                "artifact did not settle; keeping the current instance"
            );
            self.set_running(live);
            return Ok(Flow::Continue);
        };
        if live.marker.as_ref() == Some(&settled) {
            debug!(
                generation = live.generation,
                "live instance already runs the latest build"
            );
            self.set_running(live);
            return Ok(Flow::Continue);
        }

        let (path, slot) = tokio::select! {
            r = self.copy_into_free_slot(Some(live.slot)) => r?,
            _ = shutdown.as_mut() => return Ok(Flow::Shutdown),
        };

        self.stop_instance(live).await?;

        let next = tokio::select! {
            r = self.launch(path, slot, LaunchMode::Resume, Some(settled)) => r?,
            _ = shutdown.as_mut() => return Ok(Flow::Shutdown),
        };
        *live = next;
        self.summary.rotations += 1;
        Ok(Flow::Continue)
    }

    async fn settle(&self) -> Option<Marker> {
        wait_until_stable(
            &self.artifact,
            self.config.marker,
            self.config.poll_interval(),
            self.config.unreadable_after_polls.max(1),
        )
        .await
    }

    async fn copy_into_free_slot(&self, live: Option<SlotId>) -> Result<(PathBuf, SlotId)> {
        let (path, slot) = self
            .config
            .retry
            .run("copy", |_| self.rotator.obtain_copy(&self.artifact, live))
            .await?;
        info!(slot = %slot, path = %path.display(), "artifact copied into slot");
        Ok((path, slot))
    }

    async fn launch(
        &mut self,
        program: PathBuf,
        slot: SlotId,
        mode: LaunchMode,
        marker: Option<Marker>,
    ) -> Result<Instance<L::Handle>> {
        self.generation += 1;
        let verb = match mode {
            LaunchMode::Initialize => self.config.launch.init_verb.clone(),
            LaunchMode::Resume => self.config.launch.resume_verb.clone(),
        };
        let request = LaunchRequest {
            program,
            slot,
            mode,
            verb,
            state_path: self.state_path.clone(),
            extra_args: self.config.launch.extra_args.clone(),
            generation: self.generation,
        };

        let launcher = &mut self.launcher;
        let handle = self
            .config
            .retry
            .run("launch", |_| launcher.launch(&request))
            .await?;

        info!(
            generation = request.generation,
            slot = %slot,
            mode = mode.as_str(),
            pid = ?handle.id(),
            "instance launched"
        );
        self.summary.launches += 1;

        let instance = Instance {
            handle,
            slot,
            generation: request.generation,
            marker,
            exit_noticed: false,
        };
        self.set_running(&instance);
        Ok(instance)
    }

    /// Stop request, grace period, forced kill, grace period.
    async fn stop_instance(&self, live: &mut Instance<L::Handle>) -> Result<()> {
        let grace = self.config.grace_period();
        let started = Instant::now();

        if !live.handle.is_alive() {
            debug!(generation = live.generation, "instance already exited");
            return Ok(());
        }

        if let Err(e) = live.handle.request_stop() {
            warn!(generation = live.generation, error = %e, "stop request failed");
        }
        match live.handle.wait_for_exit(grace).await {
            Ok(Some(exit)) => {
                info!(generation = live.generation, code = ?exit.code, "instance stopped");
                return Ok(());
            }
            Ok(None) => {
                let err = SlotwatchError::TerminationTimeout {
                    generation: live.generation,
                    waited_ms: started.elapsed().as_millis(),
                };
                warn!(error = %err, "forcing termination");
            }
            Err(e) => {
                warn!(generation = live.generation, error = %e, "waiting for instance failed")
            }
        }

        if let Err(e) = live.handle.force_kill() {
            error!(generation = live.generation, error = %e, "forced kill failed");
        }
        match live.handle.wait_for_exit(grace).await {
            Ok(Some(exit)) => {
                warn!(generation = live.generation, code = ?exit.code, "instance killed");
                Ok(())
            }
            _ => Err(SlotwatchError::TerminationTimeout {
                generation: live.generation,
                waited_ms: started.elapsed().as_millis(),
            }),
        }
    }

    fn set_running(&mut self, live: &Instance<L::Handle>) {
        self.set_phase(Phase::Running {
            generation: live.generation,
            slot: live.slot,
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }
}
