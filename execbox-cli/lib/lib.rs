//! `execbox-cli` holds the argument parsing and error types of the `ebserver` command.

#![warn(missing_docs)]

mod args;
mod error;

pub mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use error::*;
