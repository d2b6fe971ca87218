use execbox_core::ExecboxError;
use execbox_server::ServerError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a CLI operation.
pub type ExecboxCliResult<T> = Result<T, ExecboxCliError>;

/// An error that occurred while running a CLI command.
#[derive(pretty_error_debug::Debug, Error)]
pub enum ExecboxCliError {
    /// The server could not be configured or started.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The sandbox engine could not be reached.
    #[error(transparent)]
    Core(#[from] ExecboxError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
