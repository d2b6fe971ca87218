use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a utils-related operation.
pub type UtilsResult<T> = Result<T, UtilsError>;

/// An error that occurred while using the utilities.
#[derive(pretty_error_debug::Debug, Error)]
pub enum UtilsError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("invalid value for environment variable {name}: {value:?} ({reason})")]
    InvalidEnvValue {
        /// The variable name.
        name: String,

        /// The raw value found.
        value: String,

        /// Why it was rejected.
        reason: String,
    },
}
