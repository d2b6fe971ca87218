//! The per-connection execution protocol.
//!
//! A [`Connection`] turns client control messages into coordinator calls and execution events
//! into server messages. It runs at most one execution at a time: starting a new one stops the
//! previous one first.
//!
//! Every event of an execution is delivered only while that execution is the connection's
//! current one. Executions are told apart by a generation number, so even a new execution that
//! reuses the id of the one it replaced never receives the older one's events. The check and the
//! send happen under the same lock.
//!
//! Messages to the client go through a bounded queue. A client that stops reading eventually
//! stalls the executions of its connection instead of growing the queue without limit.

use std::{
    future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use execbox_core::{
    engine::ProcessStdin,
    management::{AttachedExecution, SessionCoordinator},
    stream::ExecutionEvent,
};
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    sync::mpsc::{self, error::TrySendError},
    task::AbortHandle,
};

use crate::{
    decode::Utf8Decoder,
    payload::{
        ClientMessage, ExecutionPhase, ServerMessage, COMPLETED_MESSAGE, FAILED_MESSAGE,
        MAY_WAIT_FOR_INPUT_MESSAGE, MISSING_FIELDS_MESSAGE, NO_ACTIVE_EXECUTION_MESSAGE,
        READY_FOR_INPUT_MESSAGE, RUNNING_MESSAGE, STARTING_MESSAGE,
    },
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many messages may wait for the client before executions are held back.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How many input lines may wait for the program to read them.
pub const INPUT_QUEUE_CAPACITY: usize = 64;

/// How long a new execution waits for a stopped one with the same id to be cleaned up.
const RELEASE_WAIT: Duration = Duration::from_secs(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Behavior switches shared by all connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Send an `input_required` hint after every output chunk.
    ///
    /// This is a heuristic: nothing checks whether the program actually reads stdin.
    pub input_hints: bool,

    /// Stop executions running longer than this.
    pub execution_timeout: Option<Duration>,
}

/// One client connection of the execution protocol.
pub struct Connection {
    coordinator: Arc<SessionCoordinator>,
    settings: TransportSettings,
    outlet: Outlet,

    /// The id of the execution this connection stopped last.
    retired: Mutex<Option<String>>,
}

/// Sends messages to the client on behalf of the current execution only.
#[derive(Clone)]
struct Outlet {
    current: Arc<Mutex<Option<ActiveExecution>>>,
    generations: Arc<AtomicU64>,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Identifies one execution of a connection, even across reused ids.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Ticket {
    id: String,
    generation: u64,
}

/// The connection's current execution. Dropping it stops feeding the program's stdin.
struct ActiveExecution {
    ticket: Ticket,
    input: Option<mpsc::Sender<String>>,
    writer: Option<AbortHandle>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Connection {
    /// Creates a connection and the receiver of the messages it sends to the client.
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        settings: TransportSettings,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (outbound, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let connection = Self {
            coordinator,
            settings,
            outlet: Outlet {
                current: Arc::new(Mutex::new(None)),
                generations: Arc::new(AtomicU64::new(0)),
                outbound,
            },
            retired: Mutex::new(None),
        };
        (connection, receiver)
    }

    /// The id of the current execution, if any.
    pub fn current_execution(&self) -> Option<String> {
        self.outlet.current_id()
    }

    /// Handles one text frame from the client.
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Execute {
                language,
                code,
                execution_id,
            }) => self.execute(language, code, execution_id).await,
            Ok(ClientMessage::Input { input }) => {
                self.send_input(input.unwrap_or_default()).await
            }
            Ok(ClientMessage::Stop { execution_id }) => self.stop(execution_id).await,
            Err(e) => {
                tracing::debug!("rejected client message: {:?}", e);
                self.outlet
                    .send(ServerMessage::error(None, e.client_message()))
                    .await;
            }
        }
    }

    /// Starts an execution, stopping the current one first.
    ///
    /// The execution itself runs in the background. If it reuses the id of an execution this
    /// connection stopped, it first waits for that one to be cleaned up.
    pub async fn execute(
        &self,
        language: Option<String>,
        code: Option<String>,
        execution_id: Option<String>,
    ) {
        let (Some(language), Some(code)) = (
            language.filter(|l| !l.is_empty()),
            code.filter(|c| !c.is_empty()),
        ) else {
            self.outlet
                .send(ServerMessage::error(None, MISSING_FIELDS_MESSAGE))
                .await;
            return;
        };

        if let Some(previous) = self.outlet.take_current() {
            tracing::info!("execution {} superseded", previous.ticket.id);
            self.coordinator.stop(&previous.ticket.id).await;
            self.retire(&previous.ticket.id);
        }

        let id = execution_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let reused = self.take_retired(&id);
        let ticket = self.outlet.begin(&id);
        self.outlet
            .emit_if_current(
                &ticket,
                ServerMessage::status(&id, ExecutionPhase::Starting, STARTING_MESSAGE),
            )
            .await;

        tokio::spawn(run_execution(
            Arc::clone(&self.coordinator),
            self.outlet.clone(),
            self.settings,
            ticket,
            reused,
            language,
            code,
        ));
    }

    /// Queues `value` and a newline for the current execution's stdin.
    ///
    /// The line is written by the execution's own writer task, so a program that never reads
    /// its stdin cannot hold up the connection.
    pub async fn send_input(&self, value: String) {
        let Some((ticket, input)) = self.outlet.current_input() else {
            self.outlet
                .send(ServerMessage::error(None, NO_ACTIVE_EXECUTION_MESSAGE))
                .await;
            return;
        };

        let error = match input.try_send(format!("{}\n", value)) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                format!(
                    "Failed to send input: more than {} lines are waiting to be read",
                    INPUT_QUEUE_CAPACITY
                )
            }
            Err(TrySendError::Closed(_)) => {
                "Failed to send input: the program no longer accepts input".to_string()
            }
        };

        tracing::warn!("input to {} rejected: {}", ticket.id, error);
        self.outlet
            .emit_if_current(&ticket, ServerMessage::error(Some(&ticket.id), error))
            .await;
    }

    /// Stops `execution_id`, or the current execution if no id is given.
    ///
    /// Only this connection's current execution can be stopped. Any other id has already been
    /// stopped or finished as far as this connection is concerned, and is just acknowledged.
    pub async fn stop(&self, execution_id: Option<String>) {
        let target = execution_id.or_else(|| self.outlet.current_id());
        let Some(target) = target else {
            self.outlet.send(ServerMessage::stopped(None)).await;
            return;
        };

        if self.outlet.take_current_if(&target) {
            self.coordinator.stop(&target).await;
            self.retire(&target);
            tracing::info!("execution {} stopped by user", target);
        }
        self.outlet.send(ServerMessage::stopped(Some(&target))).await;
    }

    /// Stops the current execution after the client went away.
    pub async fn close(&self) {
        if let Some(previous) = self.outlet.take_current() {
            tracing::info!("connection closed, stopping execution {}", previous.ticket.id);
            self.coordinator.stop(&previous.ticket.id).await;
        }
    }

    fn retire(&self, id: &str) {
        *self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.to_string());
    }

    /// Whether `id` is the execution stopped last, forgetting it if so.
    fn take_retired(&self, id: &str) -> bool {
        let mut retired = self
            .retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if retired.as_deref() == Some(id) {
            *retired = None;
            true
        } else {
            false
        }
    }
}

impl Outlet {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveExecution>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message).await;
    }

    fn current_id(&self) -> Option<String> {
        self.lock().as_ref().map(|active| active.ticket.id.clone())
    }

    fn current_input(&self) -> Option<(Ticket, mpsc::Sender<String>)> {
        self.lock().as_ref().and_then(|active| {
            active
                .input
                .as_ref()
                .map(|input| (active.ticket.clone(), input.clone()))
        })
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        holds(&self.lock(), ticket)
    }

    fn begin(&self, id: &str) -> Ticket {
        let ticket = Ticket {
            id: id.to_string(),
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
        };
        *self.lock() = Some(ActiveExecution {
            ticket: ticket.clone(),
            input: None,
            writer: None,
        });
        ticket
    }

    fn take_current(&self) -> Option<ActiveExecution> {
        self.lock().take()
    }

    fn take_current_if(&self, id: &str) -> bool {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|active| active.ticket.id == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Hands the execution its input queue and writer. Fails if it is no longer current.
    fn attach_input(
        &self,
        ticket: &Ticket,
        input: mpsc::Sender<String>,
        writer: AbortHandle,
    ) -> bool {
        let mut current = self.lock();
        match current.as_mut() {
            Some(active) if active.ticket == *ticket => {
                active.input = Some(input);
                active.writer = Some(writer);
                true
            }
            _ => {
                writer.abort();
                false
            }
        }
    }

    /// Sends `message` if `ticket` is still the current execution.
    async fn emit_if_current(&self, ticket: &Ticket, message: ServerMessage) -> bool {
        let Ok(permit) = self.outbound.reserve().await else {
            return false;
        };

        let current = self.lock();
        if holds(&current, ticket) {
            permit.send(message);
            true
        } else {
            false
        }
    }

    /// Sends the final `message` of `ticket` and clears it, if it is still current.
    async fn finish_if_current(&self, ticket: &Ticket, message: ServerMessage) -> bool {
        let Ok(permit) = self.outbound.reserve().await else {
            return false;
        };

        let mut current = self.lock();
        if holds(&current, ticket) {
            permit.send(message);
            *current = None;
            true
        } else {
            false
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for ActiveExecution {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn holds(current: &Option<ActiveExecution>, ticket: &Ticket) -> bool {
    current
        .as_ref()
        .is_some_and(|active| active.ticket == *ticket)
}

/// Starts one execution and forwards its events until it exits.
async fn run_execution(
    coordinator: Arc<SessionCoordinator>,
    outlet: Outlet,
    settings: TransportSettings,
    ticket: Ticket,
    reused: bool,
    language: String,
    code: String,
) {
    let id = ticket.id.clone();
    if reused {
        if !coordinator.wait_released(&id, RELEASE_WAIT).await {
            tracing::warn!("execution {} is still being cleaned up", id);
        }
        if !outlet.is_current(&ticket) {
            return;
        }
    }

    let AttachedExecution { stdin, events, .. } =
        match coordinator.start(&id, &language, &code).await {
            Ok(execution) => execution,
            Err(e) => {
                if outlet
                    .emit_if_current(&ticket, ServerMessage::error(Some(&id), e.to_string()))
                    .await
                {
                    outlet
                        .finish_if_current(&ticket, ServerMessage::exit(&id, 1, FAILED_MESSAGE))
                        .await;
                }
                return;
            }
        };
    let mut events = events;

    let (input, lines) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_input(stdin, lines, outlet.clone(), ticket.clone()));
    if !outlet.attach_input(&ticket, input, writer.abort_handle()) {
        // The session keeps its id reserved until the events are drained, so this stops only
        // the session started above.
        tracing::debug!("execution {} was superseded while starting", id);
        coordinator.stop(&id).await;
        while events.next().await.is_some() {}
        return;
    }

    outlet
        .emit_if_current(
            &ticket,
            ServerMessage::status(&id, ExecutionPhase::Running, RUNNING_MESSAGE),
        )
        .await;
    outlet
        .emit_if_current(
            &ticket,
            ServerMessage::input_required(&id, READY_FOR_INPUT_MESSAGE),
        )
        .await;

    let deadline = async {
        match settings.execution_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut stdout = Utf8Decoder::default();
    let mut stderr = Utf8Decoder::default();
    let mut timed_out = false;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(ExecutionEvent::Output(bytes)) => {
                    let text = stdout.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    if outlet.emit_if_current(&ticket, ServerMessage::output(&id, text)).await
                        && settings.input_hints
                    {
                        outlet
                            .emit_if_current(
                                &ticket,
                                ServerMessage::input_required(&id, MAY_WAIT_FOR_INPUT_MESSAGE),
                            )
                            .await;
                    }
                }
                Some(ExecutionEvent::Error(bytes)) => {
                    let text = stderr.decode(&bytes);
                    if !text.is_empty() {
                        outlet
                            .emit_if_current(&ticket, ServerMessage::stderr(&id, text))
                            .await;
                    }
                }
                Some(ExecutionEvent::Exit(code)) => {
                    for (rest, is_stderr) in [(stdout.finish(), false), (stderr.finish(), true)] {
                        if !rest.is_empty() {
                            let message = if is_stderr {
                                ServerMessage::stderr(&id, rest)
                            } else {
                                ServerMessage::output(&id, rest)
                            };
                            outlet.emit_if_current(&ticket, message).await;
                        }
                    }
                    tracing::info!("execution {} exited with code {}", id, code);
                    outlet
                        .finish_if_current(
                            &ticket,
                            ServerMessage::exit(&id, code, COMPLETED_MESSAGE),
                        )
                        .await;
                }
                None => break,
            },
            _ = &mut deadline, if !timed_out => {
                timed_out = true;
                let limit = settings.execution_timeout.unwrap_or_default();
                tracing::warn!("execution {} timed out after {:?}", id, limit);
                outlet
                    .emit_if_current(
                        &ticket,
                        ServerMessage::error(
                            Some(&id),
                            format!("Execution timed out after {} seconds", limit.as_secs()),
                        ),
                    )
                    .await;
                coordinator.stop(&id).await;
            }
        }
    }
}

/// Feeds queued input lines to a program's stdin until the queue closes or a write fails.
async fn write_input(
    mut stdin: ProcessStdin,
    mut lines: mpsc::Receiver<String>,
    outlet: Outlet,
    ticket: Ticket,
) {
    while let Some(line) = lines.recv().await {
        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!("sent {} bytes of input to {}", line.len(), ticket.id);
                outlet
                    .emit_if_current(&ticket, ServerMessage::input_sent(&ticket.id))
                    .await;
            }
            Err(e) => {
                tracing::warn!("failed to send input to {}: {}", ticket.id, e);
                outlet
                    .emit_if_current(
                        &ticket,
                        ServerMessage::error(
                            Some(&ticket.id),
                            format!("Failed to send input: {}", e),
                        ),
                    )
                    .await;
                break;
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
