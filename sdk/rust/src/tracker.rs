//! Client-side execution state and stale message filtering.

use crate::{ServerMessage, ServerMessageKind};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What a user interface needs to know about the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientState {
    /// A connection to the server is open.
    pub connected: bool,

    /// The current execution is running.
    pub running: bool,

    /// The current execution may be waiting for input.
    pub waiting_for_input: bool,
}

/// Tracks the execution this client started last.
///
/// Server messages tagged with another execution id belong to an execution that was already
/// replaced locally and are rejected. Messages without an id (protocol errors) are accepted.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    current: Option<String>,
    state: ClientState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionTracker {
    /// The current state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The id of the current execution.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Records an open connection.
    pub fn connected(&mut self) {
        self.state.connected = true;
    }

    /// Records a lost connection. The server stops the execution of a closed connection.
    pub fn disconnected(&mut self) {
        self.current = None;
        self.state = ClientState::default();
    }

    /// Makes `execution_id` the current execution.
    pub fn begin(&mut self, execution_id: String) {
        self.current = Some(execution_id);
        self.state.running = false;
        self.state.waiting_for_input = false;
    }

    /// Records that an input line was sent.
    pub fn input_sent(&mut self) {
        self.state.waiting_for_input = false;
    }

    /// Forgets the current execution and returns its id.
    pub fn stop(&mut self) -> Option<String> {
        self.state.running = false;
        self.state.waiting_for_input = false;
        self.current.take()
    }

    /// Applies `message` and returns whether it should be delivered.
    pub fn accept(&mut self, message: &ServerMessage) -> bool {
        if let Some(id) = &message.execution_id {
            if self.current.as_deref() != Some(id.as_str()) {
                tracing::debug!("discarding {:?} for stale execution {}", message.kind, id);
                return false;
            }
        }

        match message.kind {
            ServerMessageKind::Status if message.is_running_status() => {
                self.state.running = true;
            }
            ServerMessageKind::InputRequired => {
                self.state.waiting_for_input = true;
            }
            ServerMessageKind::Exit | ServerMessageKind::Stopped
                if message.execution_id.is_some() =>
            {
                self.current = None;
                self.state.running = false;
                self.state.waiting_for_input = false;
            }
            _ => {}
        }

        true
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
