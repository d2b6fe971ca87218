use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a client operation.
pub type ClientResult<T> = Result<T, ClientError>;

/// An error returned by [`crate::ExecutionClient`].
#[derive(pretty_error_debug::Debug, Error)]
pub enum ClientError {
    /// The client is between connections.
    #[error("not connected to the execution server")]
    NotConnected,

    /// The connection went away while a message was being sent.
    #[error("connection error: {0}")]
    Connection(String),

    /// A message could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
