//! The sandbox engine capability.
//!
//! Everything that touches a real isolation backend goes through [`SandboxEngine`], so the pool,
//! the deployer and the coordinator can run against Docker in production and against an
//! in-memory engine in tests.

use std::{fmt, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::{config::SandboxLimits, ExecboxResult};

mod docker;
#[cfg(any(test, feature = "test-utils"))]
mod memory;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use docker::*;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Lifecycle state of a sandbox as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// The sandbox does not exist.
    Absent,

    /// The sandbox is being (re)started.
    Starting,

    /// The sandbox is running and can execute processes.
    Running,

    /// The sandbox is frozen and must be unpaused first.
    Paused,

    /// The sandbox exists but is not running.
    Stopped,
}

/// A sandbox found while scanning the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSummary {
    /// Engine-assigned identity.
    pub id: String,

    /// The image the sandbox was created from.
    pub image: String,

    /// The state at scan time.
    pub state: SandboxState,
}

/// What the pool asks the engine to create.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// The runtime the sandbox serves. Stored as a label for later discovery.
    pub runtime: String,

    /// The image to create the sandbox from.
    pub image: String,

    /// Resource limits.
    pub limits: SandboxLimits,
}

/// One chunk read from an attached process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Bytes written to stdout.
    Stdout(Bytes),

    /// Bytes written to stderr.
    Stderr(Bytes),
}

/// The combined output of an attached process. Ends when the process exits.
pub type ProcessOutputStream = BoxStream<'static, ExecboxResult<ProcessOutput>>;

/// The stdin of an attached process.
pub type ProcessStdin = Pin<Box<dyn AsyncWrite + Send>>;

/// A live process inside a sandbox with stdin, stdout and stderr attached.
pub struct AttachedProcess {
    /// Engine-assigned process identity, used to query the exit code.
    pub id: String,

    /// Separated stdout/stderr chunks in emission order.
    pub output: ProcessOutputStream,

    /// The process's stdin.
    pub stdin: ProcessStdin,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// An isolation backend able to host long-lived sandboxes and run processes inside them.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Lists the sandboxes labelled for `runtime_id`, including stopped ones.
    async fn list_sandboxes(&self, runtime_id: &str) -> ExecboxResult<Vec<SandboxSummary>>;

    /// Returns the current state of a sandbox.
    ///
    /// Fails with [`crate::ExecboxError::SandboxNotFound`] if the sandbox was removed.
    async fn inspect_sandbox(&self, sandbox_id: &str) -> ExecboxResult<SandboxState>;

    /// Starts a stopped sandbox.
    async fn start_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()>;

    /// Unpauses a paused sandbox.
    async fn unpause_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()>;

    /// Makes sure `image` is available locally, pulling it if needed. May be slow.
    async fn ensure_image(&self, image: &str) -> ExecboxResult<()>;

    /// Creates a new sandbox and returns its id. The sandbox is not started.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> ExecboxResult<String>;

    /// Stops and removes a sandbox.
    async fn remove_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()>;

    /// Creates `path` (and its parents) inside the sandbox.
    async fn make_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()>;

    /// Recursively removes `path` inside the sandbox.
    async fn remove_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()>;

    /// Extracts a tar archive into `path` inside the sandbox. `path` must exist.
    async fn upload_archive(&self, sandbox_id: &str, path: &str, archive: Bytes)
        -> ExecboxResult<()>;

    /// Starts `command` through a shell in `workdir` with all standard streams attached and no
    /// pseudo-terminal.
    async fn spawn_attached(
        &self,
        sandbox_id: &str,
        workdir: &str,
        command: &str,
    ) -> ExecboxResult<AttachedProcess>;

    /// Returns the exit code of a process, or `None` while it is still running.
    async fn process_exit_code(&self, process_id: &str) -> ExecboxResult<Option<i64>>;

    /// Kills a process started by [`SandboxEngine::spawn_attached`] along with its children.
    async fn terminate(&self, sandbox_id: &str, workdir: &str, process_id: &str)
        -> ExecboxResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl fmt::Debug for AttachedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedProcess")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
