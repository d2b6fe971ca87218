//! Middleware components for the execbox server.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
};

//--------------------------------------------------------------------------------------------------
// Middleware Functions
//--------------------------------------------------------------------------------------------------

/// Log incoming requests
pub async fn logging_middleware(
    req: Request<Body>,
    next: Next,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::info!("Request: {} {}", method, uri);

    let response = next.run(req).await;

    tracing::info!("Response: {} {}: {}", method, uri, response.status());

    Ok(response)
}
