//! Wire messages of the execution protocol and HTTP response payloads.
//!
//! Clients send [`ClientMessage`]s as JSON text frames and receive [`ServerMessage`]s. Every
//! server message that belongs to an execution carries that execution's id.

use execbox_core::{management::SandboxHandle, management::SessionSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Status text sent when an execution is accepted.
pub const STARTING_MESSAGE: &str = "Starting execution...";

/// Status text sent when the program is live.
pub const RUNNING_MESSAGE: &str = "Execution started. You can send input now.";

/// Hint sent once the program is live.
pub const READY_FOR_INPUT_MESSAGE: &str = "Program is ready to accept input";

/// Hint sent after each output chunk when input hints are enabled.
pub const MAY_WAIT_FOR_INPUT_MESSAGE: &str = "Program may be waiting for input";

/// Exit text for programs that ran to the end, whatever their exit code.
pub const COMPLETED_MESSAGE: &str = "Execution completed";

/// Exit text for executions that could not be started.
pub const FAILED_MESSAGE: &str = "Execution failed";

/// Text of the `stopped` event.
pub const STOPPED_MESSAGE: &str = "Execution stopped by user";

/// Text of the `input-sent` event.
pub const INPUT_SENT_MESSAGE: &str = "Input sent successfully";

/// Error sent when input arrives while nothing is running.
pub const NO_ACTIVE_EXECUTION_MESSAGE: &str = "No active execution to send input to";

/// Error sent when an execute request lacks a language or code.
pub const MISSING_FIELDS_MESSAGE: &str = "Language and code are required";

//--------------------------------------------------------------------------------------------------
// Types: Protocol
//--------------------------------------------------------------------------------------------------

/// A control message from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run code, replacing any running execution of this connection.
    Execute {
        /// The runtime id.
        #[serde(default, alias = "runtime")]
        language: Option<String>,

        /// The source code.
        #[serde(default)]
        code: Option<String>,

        /// A client-chosen execution id.
        #[serde(default, rename = "executionId")]
        execution_id: Option<String>,
    },

    /// Send a line to the running program.
    Input {
        /// The line, without its newline.
        #[serde(default, alias = "value")]
        input: Option<String>,
    },

    /// Stop an execution, the current one if no id is given.
    Stop {
        /// The execution to stop.
        #[serde(default, rename = "executionId")]
        execution_id: Option<String>,
    },
}

/// Why a text frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageParseError {
    /// The frame is not valid JSON or does not match the message shape.
    Invalid(String),

    /// The `type` field names no known message.
    UnknownType(String),
}

/// The kind of a [`ServerMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageKind {
    /// Execution phase change.
    Status,

    /// Program stdout.
    Output,

    /// Program stderr or an execution failure.
    Error,

    /// Heuristic hint that the program may be reading stdin.
    InputRequired,

    /// Acknowledges an input message.
    #[serde(rename = "input-sent")]
    InputSent,

    /// The program finished.
    Exit,

    /// The execution was stopped on request.
    Stopped,
}

/// Execution phases reported through `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Accepted, sandbox and deployment in progress.
    Starting,

    /// The program is live.
    Running,
}

/// An event sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// The message kind.
    #[serde(rename = "type")]
    pub kind: ServerMessageKind,

    /// The phase, for `status` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionPhase>,

    /// Human readable text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Program output, for `output` and stderr `error` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Failure description, for `error` messages not produced by the program.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The exit code, for `exit` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,

    /// The execution the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: REST API Responses
//--------------------------------------------------------------------------------------------------

/// A plain message response.
#[derive(Debug, Serialize)]
pub struct RegularMessageResponse {
    /// The message.
    pub message: String,
}

/// An error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: String,
}

/// Response of the status endpoint.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// The pooled sandboxes.
    pub sandboxes: Vec<SandboxHandle>,

    /// The active execution sessions.
    pub sessions: Vec<SessionSummary>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ClientMessage {
    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, MessageParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| MessageParseError::Invalid(e.to_string()))?;

        match value.get("type").and_then(Value::as_str) {
            Some("execute" | "input" | "stop") => serde_json::from_value(value)
                .map_err(|e| MessageParseError::Invalid(e.to_string())),
            Some(other) => Err(MessageParseError::UnknownType(other.to_string())),
            None => Err(MessageParseError::Invalid(
                "missing field `type`".to_string(),
            )),
        }
    }
}

impl MessageParseError {
    /// The error text sent back to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Invalid(reason) => format!("Invalid message: {}", reason),
            Self::UnknownType(kind) => format!("Unknown message type: {}", kind),
        }
    }
}

impl ServerMessage {
    fn new(kind: ServerMessageKind, execution_id: Option<&str>) -> Self {
        Self {
            kind,
            status: None,
            message: None,
            data: None,
            error: None,
            exit_code: None,
            execution_id: execution_id.map(str::to_string),
        }
    }

    /// A `status` message.
    pub fn status(execution_id: &str, phase: ExecutionPhase, message: &str) -> Self {
        Self {
            status: Some(phase),
            message: Some(message.to_string()),
            ..Self::new(ServerMessageKind::Status, Some(execution_id))
        }
    }

    /// An `output` message carrying program stdout.
    pub fn output(execution_id: &str, data: String) -> Self {
        Self {
            data: Some(data),
            ..Self::new(ServerMessageKind::Output, Some(execution_id))
        }
    }

    /// An `error` message carrying program stderr.
    pub fn stderr(execution_id: &str, data: String) -> Self {
        Self {
            data: Some(data),
            ..Self::new(ServerMessageKind::Error, Some(execution_id))
        }
    }

    /// An `error` message describing a failure, optionally attributed to an execution.
    pub fn error(execution_id: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(ServerMessageKind::Error, execution_id)
        }
    }

    /// An `input_required` hint.
    pub fn input_required(execution_id: &str, message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Self::new(ServerMessageKind::InputRequired, Some(execution_id))
        }
    }

    /// An `input-sent` acknowledgement.
    pub fn input_sent(execution_id: &str) -> Self {
        Self {
            message: Some(INPUT_SENT_MESSAGE.to_string()),
            ..Self::new(ServerMessageKind::InputSent, Some(execution_id))
        }
    }

    /// An `exit` message.
    pub fn exit(execution_id: &str, exit_code: i64, message: &str) -> Self {
        Self {
            exit_code: Some(exit_code),
            message: Some(message.to_string()),
            ..Self::new(ServerMessageKind::Exit, Some(execution_id))
        }
    }

    /// A `stopped` message.
    pub fn stopped(execution_id: Option<&str>) -> Self {
        Self {
            message: Some(STOPPED_MESSAGE.to_string()),
            ..Self::new(ServerMessageKind::Stopped, execution_id)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
