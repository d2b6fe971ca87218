use clap::Parser;
use execbox_utils::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};

use crate::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for the ebserver command
#[derive(Debug, Parser)]
#[command(name = "ebserver", author, version, styles=styles::styles())]
pub struct EbserverArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_SERVER_HOST)]
    pub host: String,

    /// Port number to listen on
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    pub port: u16,

    /// Run in development mode
    #[arg(long = "dev", default_value_t = false)]
    pub dev_mode: bool,

    /// Show only errors
    #[arg(long, global = true)]
    pub error: bool,

    /// Show warnings and errors
    #[arg(long, global = true)]
    pub warn: bool,

    /// Show info, warnings and errors
    #[arg(long, global = true)]
    pub info: bool,

    /// Show debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Show trace output
    #[arg(long, global = true)]
    pub trace: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EbserverArgs {
    /// The log filter selected by the level flags, if any. The most verbose flag wins.
    pub fn log_directive(&self) -> Option<String> {
        let level = if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else if self.info {
            "info"
        } else if self.warn {
            "warn"
        } else if self.error {
            "error"
        } else {
            return None;
        };

        Some(format!(
            "execbox_core={},execbox_server={},ebserver={}",
            level, level, level
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
