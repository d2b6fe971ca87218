//! Configuration types for execbox-core.

mod limits;
mod runtime;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use limits::*;
pub use runtime::*;
