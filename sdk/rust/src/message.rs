//! Messages exchanged with the execution server.

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A control message sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Runs `code` with the given runtime.
    Execute {
        /// The runtime id.
        language: String,

        /// The source code.
        code: String,

        /// The id the server tags every event of this execution with.
        #[serde(rename = "executionId")]
        execution_id: String,
    },

    /// Sends one line to the running program.
    Input {
        /// The line, without its newline.
        input: String,
    },

    /// Stops an execution.
    Stop {
        /// The execution to stop, the server's current one if absent.
        #[serde(rename = "executionId", skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
}

/// The kind of a [`ServerMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageKind {
    /// Execution phase change.
    Status,

    /// Program stdout.
    Output,

    /// Program stderr or a failure.
    Error,

    /// The program may be waiting for input.
    InputRequired,

    /// The server wrote an input line.
    #[serde(rename = "input-sent")]
    InputSent,

    /// The program finished.
    Exit,

    /// The execution was stopped.
    Stopped,

    /// A kind this client does not know.
    #[serde(other)]
    Unknown,
}

/// An event received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// The message kind.
    #[serde(rename = "type")]
    pub kind: ServerMessageKind,

    /// The phase of a `status` message, `starting` or `running`.
    #[serde(default)]
    pub status: Option<String>,

    /// Human readable text.
    #[serde(default)]
    pub message: Option<String>,

    /// Program output.
    #[serde(default)]
    pub data: Option<String>,

    /// A failure description.
    #[serde(default)]
    pub error: Option<String>,

    /// The exit code of an `exit` message.
    #[serde(default)]
    pub exit_code: Option<i64>,

    /// The execution the message belongs to.
    #[serde(default)]
    pub execution_id: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerMessage {
    /// Whether this is the `status{running}` message.
    pub fn is_running_status(&self) -> bool {
        self.kind == ServerMessageKind::Status && self.status.as_deref() == Some("running")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_message_shape() {
        let execute = serde_json::to_value(ClientMessage::Execute {
            language: "python".to_string(),
            code: "print(1)".to_string(),
            execution_id: "e1".to_string(),
        })
        .unwrap();
        assert_eq!(
            execute,
            json!({"type": "execute", "language": "python", "code": "print(1)", "executionId": "e1"})
        );

        let stop = serde_json::to_value(ClientMessage::Stop { execution_id: None }).unwrap();
        assert_eq!(stop, json!({"type": "stop"}));
    }

    #[test]
    fn test_server_message_parsing() {
        let message: ServerMessage = serde_json::from_str(
            r#"{"type":"exit","exitCode":3,"message":"Execution completed","executionId":"e1"}"#,
        )
        .unwrap();
        assert_eq!(message.kind, ServerMessageKind::Exit);
        assert_eq!(message.exit_code, Some(3));
        assert_eq!(message.execution_id.as_deref(), Some("e1"));

        let sent: ServerMessage = serde_json::from_str(r#"{"type":"input-sent"}"#).unwrap();
        assert_eq!(sent.kind, ServerMessageKind::InputSent);

        let unknown: ServerMessage = serde_json::from_str(r#"{"type":"telemetry"}"#).unwrap();
        assert_eq!(unknown.kind, ServerMessageKind::Unknown);
    }
}
