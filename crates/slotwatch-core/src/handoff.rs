//! Target-side half of the handoff contract.
//!
//! A supervised program is started as `<program> <verb> <state_path> [extra...]`.
//! These helpers parse that invocation and pick the starting state.

use std::path::PathBuf;

use serde::de::DeserializeOwned;

use crate::config::LaunchConfig;
use crate::error::{Result, SlotwatchError};
use crate::store::StateStore;

/// Mode requested by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetMode {
    /// Start fresh and overwrite whatever state exists.
    Initialize,
    /// Continue from the state record if there is one.
    Resume,
}

/// Parsed command line of a supervised program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetInvocation {
    /// Requested mode.
    pub mode: TargetMode,
    /// State record location.
    pub state_path: PathBuf,
    /// Arguments after the state path.
    pub rest: Vec<String>,
}

impl TargetInvocation {
    /// Parses arguments (without the program name) using the default verbs.
    ///
    /// `resume` is accepted as an alias of the resume verb.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let verbs = LaunchConfig::default();
        Self::with_verbs(args, &verbs.init_verb, &verbs.resume_verb)
    }

    /// Parses arguments with custom mode words.
    pub fn with_verbs<I>(args: I, init_verb: &str, resume_verb: &str) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let verb = args
            .next()
            .ok_or_else(|| SlotwatchError::Config("missing mode argument".into()))?;
        let mode = if verb == init_verb {
            TargetMode::Initialize
        } else if verb == resume_verb || verb == "resume" {
            TargetMode::Resume
        } else {
            return Err(SlotwatchError::Config(format!(
                "unknown mode {verb:?}, expected {init_verb:?} or {resume_verb:?}"
            )));
        };
        let state_path = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| SlotwatchError::Config("missing state path argument".into()))?;

        Ok(Self {
            mode,
            state_path,
            rest: args.collect(),
        })
    }

    /// Store at the invocation's state path.
    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state_path)
    }

    /// State to begin with: always `None` when initializing, otherwise
    /// whatever the previous instance left (or `None`).
    pub fn initial_state<T: DeserializeOwned>(&self) -> Option<T> {
        match self.mode {
            TargetMode::Initialize => None,
            TargetMode::Resume => self.store().load(),
        }
    }
}
