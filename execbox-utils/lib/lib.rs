//! `execbox_utils` is a library containing general utilities for the execbox project.

#![warn(missing_docs)]

mod defaults;
mod error;

pub mod env;
pub mod term;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use error::*;
pub use term::*;
