//! `execbox-server` serves sandboxed code execution to browsers and other clients.
//!
//! It exposes a small HTTP API and the WebSocket execution protocol. Each WebSocket connection is
//! a [`transport::Connection`] that runs one execution at a time on the shared
//! [`execbox_core::management::SessionCoordinator`].

#![warn(missing_docs)]

mod decode;

pub mod config;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod payload;
pub mod route;
pub mod state;
pub mod transport;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use config::*;
pub use error::*;
pub use payload::*;
pub use route::*;
pub use state::*;
pub use transport::*;
