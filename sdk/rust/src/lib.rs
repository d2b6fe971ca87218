//! Execbox Rust SDK
//!
//! A client for the execbox WebSocket execution protocol. [`ExecutionClient`] keeps a connection
//! to the server alive, reconnecting after a fixed delay, and only hands out server messages
//! that belong to the execution it started last.
//!
//! ```no_run
//! use execbox::{ClientOptions, ExecutionClient};
//!
//! # async fn run() -> execbox::ClientResult<()> {
//! let (client, mut messages) =
//!     ExecutionClient::connect("ws://127.0.0.1:3000/ws/execute", ClientOptions::default());
//! client.wait_connected().await;
//! client.execute("python", "print(input('name? '))")?;
//! while let Some(message) = messages.recv().await {
//!     println!("{:?}", message);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod error;
mod message;
mod tracker;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use error::*;
pub use message::*;
pub use tracker::*;
