#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Keeps the latest build of an executable running across rebuilds.
//!
//! The artifact is never executed in place. Each build is copied into a free
//! slot and run from there, the previous instance is stopped, and the new one
//! is pointed at the same state record so it can resume.

pub mod artifact;
pub mod config;
pub mod error;
pub mod handoff;
pub mod process;
pub mod retry;
pub mod slots;
pub mod store;
pub mod supervisor;
pub mod watcher;

pub use artifact::{read_marker, read_marker_blocking, Marker, MarkerMode};
pub use config::{Config, LaunchConfig};
pub use error::{Result, SlotwatchError};
pub use handoff::{TargetInvocation, TargetMode};
pub use process::{
    ChildHandle, ChildLauncher, InstanceExit, LaunchMode, LaunchRequest, Launcher, ProcessHandle,
};
pub use retry::RetryPolicy;
pub use slots::{obtain_copy, slots_from_hint, SlotId, SlotRotator};
pub use store::{LoadOutcome, StateStore};
pub use supervisor::{Phase, RunSummary, Supervisor};
pub use watcher::{wait_until_stable, ArtifactWatcher, WatchEvent, WatcherHandle};
