//! Request handlers for the execbox server.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};

use crate::{
    payload::{RegularMessageResponse, StatusResponse},
    state::AppState,
    ServerResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: REST API Handlers
//--------------------------------------------------------------------------------------------------

/// Liveness banner
pub async fn root() -> &'static str {
    "API is running..."
}

/// Handler for health check
pub async fn health() -> ServerResult<impl IntoResponse> {
    Ok((
        StatusCode::OK,
        Json(RegularMessageResponse {
            message: "Service is healthy".to_string(),
        }),
    ))
}

/// Lists the pooled sandboxes and the active execution sessions
pub async fn status(State(state): State<AppState>) -> ServerResult<impl IntoResponse> {
    Ok((
        StatusCode::OK,
        Json(StatusResponse {
            sandboxes: state.get_pool().snapshot().await,
            sessions: state.get_coordinator().active_sessions(),
        }),
    ))
}

//--------------------------------------------------------------------------------------------------
// Functions: WebSocket Handlers
//--------------------------------------------------------------------------------------------------

/// Upgrades to the execution protocol
pub async fn execute_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (connection, mut outbound) = state.connect();
    tracing::info!("client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to encode message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("websocket receive failed: {}", e);
                break;
            }
        }
    }

    tracing::info!("client disconnected");
    connection.close().await;
    writer.abort();
}
