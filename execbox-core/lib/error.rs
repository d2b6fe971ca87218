use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an execbox-core operation.
pub type ExecboxResult<T> = Result<T, ExecboxError>;

/// An error that occurred while managing sandboxes or executions.
///
/// A program that runs and exits with a non-zero code is not an error. It is reported through
/// the ordinary exit event of its execution.
#[derive(pretty_error_debug::Debug, Error)]
pub enum ExecboxError {
    /// The requested language is not in the runtime registry.
    #[error("Unsupported language: {0}")]
    UnsupportedRuntime(String),

    /// The sandbox for a runtime could not be reached, pulled, created or started.
    #[error("Sandbox unavailable for {runtime}: {reason}")]
    SandboxUnavailable {
        /// The runtime whose sandbox failed.
        runtime: String,

        /// What went wrong.
        reason: String,
    },

    /// The sandbox referenced by id no longer exists.
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    /// Creating the execution directory or writing the code archive failed.
    #[error("Failed to deploy code for session {session_id}: {reason}")]
    DeploymentFailure {
        /// The session being deployed.
        session_id: String,

        /// What went wrong.
        reason: String,
    },

    /// The session id cannot be used as an execution path component.
    #[error("Invalid session id {0:?}: use 1-64 alphanumeric characters, hyphens or underscores")]
    InvalidSessionId(String),

    /// A session with the same id is already active.
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    /// The session was stopped before its process started.
    #[error("Session {0} was stopped before it started")]
    SessionStopped(String),

    /// The sandbox engine reported an error.
    #[error("Sandbox engine error: {0}")]
    Engine(String),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<bollard::errors::Error> for ExecboxError {
    fn from(error: bollard::errors::Error) -> Self {
        match error {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => ExecboxError::SandboxNotFound(message),
            other => ExecboxError::Engine(other.to_string()),
        }
    }
}
