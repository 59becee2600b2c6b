//! Process control capability used by the supervisor.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::{Result, SlotwatchError};
use crate::slots::SlotId;

/// How a launched instance should treat the state record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Ignore any existing state.
    Initialize,
    /// Load the state record and continue from it.
    Resume,
}

impl LaunchMode {
    /// Name used in the `SLOTWATCH_MODE` variable.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Resume => "resume",
        }
    }
}

/// Everything needed to start one instance.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    /// Slot copy to execute.
    pub program: PathBuf,
    /// Slot the program lives in.
    pub slot: SlotId,
    /// Initialize or resume.
    pub mode: LaunchMode,
    /// Mode word passed as the first argument.
    pub verb: String,
    /// State record location, passed as the second argument.
    pub state_path: PathBuf,
    /// Appended after the state path.
    pub extra_args: Vec<String>,
    /// Launch sequence number, starting at 1.
    pub generation: u64,
}

impl LaunchRequest {
    /// Command-line arguments: `<verb> <state_path> [extra...]`.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.verb.clone(), self.state_path.display().to_string()];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// How an instance ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceExit {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
}

/// A running instance.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Returns false once the process has exited.
    fn is_alive(&mut self) -> bool;

    /// Asks the process to exit on its own terms.
    fn request_stop(&mut self) -> io::Result<()>;

    /// Terminates the process unconditionally.
    fn force_kill(&mut self) -> io::Result<()>;

    /// Waits up to `timeout`; `None` means the process is still running.
    async fn wait_for_exit(&mut self, timeout: Duration) -> io::Result<Option<InstanceExit>>;
}

/// Starts instances.
pub trait Launcher: Send {
    /// Handle type for launched instances.
    type Handle: ProcessHandle;

    /// Starts the program named in `request`.
    fn launch(&mut self, request: &LaunchRequest) -> Result<Self::Handle>;
}

/// Runs real child processes with inherited stdio.
#[derive(Clone, Debug, Default)]
pub struct ChildLauncher;

impl Launcher for ChildLauncher {
    type Handle = ChildHandle;

    fn launch(&mut self, request: &LaunchRequest) -> Result<ChildHandle> {
        let child = Command::new(&request.program)
            .args(request.args())
            .env("SLOTWATCH_STATE_PATH", &request.state_path)
            .env("SLOTWATCH_MODE", request.mode.as_str())
            .env("SLOTWATCH_SLOT", request.slot.to_string())
            .env("SLOTWATCH_GENERATION", request.generation.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SlotwatchError::LaunchFailed {
                program: request.program.clone(),
                source,
            })?;
        Ok(ChildHandle { child })
    }
}

/// [`ProcessHandle`] over a tokio child.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> io::Result<()> {
        // no portable polite stop
        self.child.start_kill()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // already reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> io::Result<Option<InstanceExit>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(InstanceExit {
                code: status?.code(),
            })),
            Err(_) => Ok(None),
        }
    }
}
