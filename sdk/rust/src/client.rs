//! The reconnecting execution client.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use execbox_utils::DEFAULT_RECONNECT_DELAY_SECS;
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::{
    ClientError, ClientMessage, ClientResult, ClientState, ExecutionTracker, ServerMessage,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options of an [`ExecutionClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long to wait before reconnecting after a connection closes or fails.
    pub reconnect_delay: Duration,
}

/// A client of the execution protocol that keeps reconnecting to the server.
///
/// Messages of the execution started last are delivered through the receiver returned by
/// [`ExecutionClient::connect`]; messages of earlier executions are dropped.
pub struct ExecutionClient {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

struct Shared {
    inner: Mutex<Inner>,
    state: watch::Sender<ClientState>,
}

struct Inner {
    tracker: ExecutionTracker,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecutionClient {
    /// Starts connecting to `url` in the background.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        options: ClientOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (state, _) = watch::channel(ClientState::default());
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                tracker: ExecutionTracker::default(),
                outbound: None,
            }),
            state,
        });

        let (inbound, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection_loop(
            url.into(),
            options,
            Arc::clone(&shared),
            inbound,
        ));

        (Self { shared, task }, receiver)
    }

    /// The current state.
    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Waits until a connection is open.
    pub async fn wait_connected(&self) {
        let mut state = self.subscribe();
        let _ = state.wait_for(|state| state.connected).await;
    }

    /// Runs `code` and returns the new execution id.
    ///
    /// The server stops any execution this connection was running.
    pub fn execute(&self, language: &str, code: &str) -> ClientResult<String> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let message = serde_json::to_string(&ClientMessage::Execute {
            language: language.to_string(),
            code: code.to_string(),
            execution_id: execution_id.clone(),
        })?;

        self.shared.update(|inner| {
            let outbound = inner.outbound.as_ref().ok_or(ClientError::NotConnected)?;
            send(outbound, message)?;
            inner.tracker.begin(execution_id.clone());
            Ok::<(), ClientError>(())
        })?;

        tracing::debug!("started execution {}", execution_id);
        Ok(execution_id)
    }

    /// Sends one line to the running program.
    pub fn send_input(&self, value: &str) -> ClientResult<()> {
        let message = serde_json::to_string(&ClientMessage::Input {
            input: value.to_string(),
        })?;

        self.shared.update(|inner| {
            let outbound = inner.outbound.as_ref().ok_or(ClientError::NotConnected)?;
            send(outbound, message)?;
            inner.tracker.input_sent();
            Ok(())
        })
    }

    /// Stops the current execution.
    ///
    /// Local state is cleared first, so nothing more from that execution is delivered.
    pub fn stop(&self) -> ClientResult<()> {
        self.shared.update(|inner| {
            let execution_id = inner.tracker.stop();
            let outbound = inner.outbound.as_ref().ok_or(ClientError::NotConnected)?;
            let message = serde_json::to_string(&ClientMessage::Stop { execution_id })?;
            send(outbound, message)
        })
    }

    /// Closes the connection and stops reconnecting.
    pub fn close(self) {
        self.task.abort();
        self.shared.update(|inner| {
            inner.outbound = None;
            inner.tracker.disconnected();
        });
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` on the inner state and publishes the resulting client state.
    fn update<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.lock();
        let result = f(&mut inner);
        self.state.send_replace(inner.tracker.state());
        result
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
        }
    }
}

impl Drop for ExecutionClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn send(outbound: &mpsc::UnboundedSender<String>, message: String) -> ClientResult<()> {
    outbound
        .send(message)
        .map_err(|_| ClientError::Connection("connection closed".to_string()))
}

async fn run_connection_loop(
    url: String,
    options: ClientOptions,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!("connected to {}", url);
                let (mut sink, mut stream) = socket.split();
                let (outbound, mut pending) = mpsc::unbounded_channel::<String>();
                shared.update(|inner| {
                    inner.outbound = Some(outbound);
                    inner.tracker.connected();
                });

                loop {
                    tokio::select! {
                        Some(text) = pending.recv() => {
                            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                tracing::warn!("failed to send to {}: {}", url, e);
                                break;
                            }
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                receive(&shared, &inbound, text.as_str());
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("connection to {} failed: {}", url, e);
                                break;
                            }
                        }
                    }
                }

                shared.update(|inner| {
                    inner.outbound = None;
                    inner.tracker.disconnected();
                });
                tracing::info!("disconnected from {}", url);
            }
            Err(e) => {
                tracing::warn!("could not connect to {}: {}", url, e);
            }
        }

        tokio::time::sleep(options.reconnect_delay).await;
    }
}

fn receive(shared: &Shared, inbound: &mpsc::UnboundedSender<ServerMessage>, text: &str) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("ignoring malformed server message: {}", e);
            return;
        }
    };

    if shared.update(|inner| inner.tracker.accept(&message)) {
        let _ = inbound.send(message);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    use super::*;
    use crate::ServerMessageKind;

    fn options() -> ClientOptions {
        ClientOptions {
            reconnect_delay: Duration::from_millis(20),
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_json(server: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match server.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn push(server: &mut WebSocketStream<TcpStream>, value: Value) {
        server
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_only_current_execution_is_delivered() {
        let (listener, url) = listen().await;
        let (client, mut messages) = ExecutionClient::connect(url, options());
        let mut server = accept(&listener).await;
        client.wait_connected().await;

        let first = client.execute("python", "print(1)").unwrap();
        let request = next_json(&mut server).await;
        assert_eq!(request["type"], "execute");
        assert_eq!(request["language"], "python");
        assert_eq!(request["executionId"], first.as_str());

        let second = client.execute("python", "print(2)").unwrap();
        next_json(&mut server).await;

        push(&mut server, json!({"type": "output", "data": "1\n", "executionId": first})).await;
        push(
            &mut server,
            json!({"type": "status", "status": "running", "executionId": second}),
        )
        .await;
        push(&mut server, json!({"type": "output", "data": "2\n", "executionId": second})).await;
        push(&mut server, json!({"type": "exit", "exitCode": 0, "executionId": second})).await;

        let status = messages.recv().await.unwrap();
        assert!(status.is_running_status());

        let output = messages.recv().await.unwrap();
        assert_eq!(output.data.as_deref(), Some("2\n"));

        let exit = messages.recv().await.unwrap();
        assert_eq!(exit.kind, ServerMessageKind::Exit);
        assert!(!client.state().running);
    }

    #[tokio::test]
    async fn test_input_and_stop_messages() {
        let (listener, url) = listen().await;
        let (client, mut messages) = ExecutionClient::connect(url, options());
        let mut server = accept(&listener).await;
        client.wait_connected().await;

        let id = client.execute("javascript", "1").unwrap();
        next_json(&mut server).await;

        push(
            &mut server,
            json!({"type": "input_required", "message": "m", "executionId": id}),
        )
        .await;
        messages.recv().await.unwrap();
        assert!(client.state().waiting_for_input);

        client.send_input("bob").unwrap();
        assert!(!client.state().waiting_for_input);
        assert_eq!(
            next_json(&mut server).await,
            json!({"type": "input", "input": "bob"})
        );

        client.stop().unwrap();
        assert_eq!(
            next_json(&mut server).await,
            json!({"type": "stop", "executionId": id})
        );

        push(&mut server, json!({"type": "stopped", "executionId": id})).await;
        push(&mut server, json!({"type": "error", "error": "late"})).await;
        let delivered = messages.recv().await.unwrap();
        assert_eq!(delivered.error.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let (listener, url) = listen().await;
        let (client, _messages) = ExecutionClient::connect(url, options());
        let mut state = client.subscribe();

        let mut server = accept(&listener).await;
        client.wait_connected().await;
        client.execute("python", "input()").unwrap();
        next_json(&mut server).await;

        server.close(None).await.unwrap();
        drop(server);
        state.wait_for(|state| !state.connected).await.unwrap();
        assert!(!client.state().running);
        assert!(matches!(
            client.execute("python", "1"),
            Err(ClientError::NotConnected)
        ));

        let _server = accept(&listener).await;
        state.wait_for(|state| state.connected).await.unwrap();
        assert!(client.execute("python", "1").is_ok());
    }

    #[tokio::test]
    async fn test_close_stops_reconnecting() {
        let (listener, url) = listen().await;
        let (client, _messages) = ExecutionClient::connect(url, options());
        let _server = accept(&listener).await;
        client.wait_connected().await;

        let state = client.subscribe();
        client.close();
        assert!(!state.borrow().connected);
    }
}
