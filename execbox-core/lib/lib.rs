//! `execbox-core` runs untrusted code inside pooled, long-lived language sandboxes.
//!
//! # Overview
//!
//! The crate keeps at most one sandbox per supported language and multiplexes many concurrent,
//! independently cancellable executions onto it. Every execution gets its own directory inside
//! the sandbox, so executions sharing a sandbox never see each other's code.
//!
//! # Architecture
//!
//! - **Config**: the runtime registry and sandbox resource limits
//! - **Engine**: the [`engine::SandboxEngine`] capability, implemented with Docker and in memory
//! - **Management**: sandbox pooling, code deployment and execution session coordination
//! - **Stream**: demultiplexing an attached process into typed execution events
//!
//! # Modules
//!
//! - [`config`] - Runtime registry and resource limits
//! - [`engine`] - Sandbox engine abstraction and implementations
//! - [`management`] - Pool manager, code deployer and session coordinator
//! - [`stream`] - Execution event demultiplexer
//! - [`utils`] - Path and archive helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod management;
pub mod stream;
pub mod utils;

pub use error::*;
