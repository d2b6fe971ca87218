//! Sandbox pooling, code deployment and execution session coordination.
//!
//! - [`SandboxPool`] keeps one long-lived sandbox per runtime
//! - [`CodeDeployer`] writes submitted code into a session's own directory
//! - [`SessionCoordinator`] runs sessions end to end and cleans them up

mod deploy;
mod pool;
mod session;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use deploy::*;
pub use pool::*;
pub use session::*;
