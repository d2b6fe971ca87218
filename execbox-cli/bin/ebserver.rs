use std::sync::Arc;

use axum::http::{header::CONTENT_TYPE, Method};
use clap::Parser;
use execbox_cli::{EbserverArgs, ExecboxCliResult};
use execbox_core::engine::DockerEngine;
use execbox_server::{route, AppState, ServerConfig};
use execbox_utils::{CHECKMARK, EXECUTE_WS_PATH};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DEFAULT_LOG_DIRECTIVE: &str = "execbox_core=info,execbox_server=info,ebserver=info";

//--------------------------------------------------------------------------------------------------
// Functions: Main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
pub async fn main() -> ExecboxCliResult<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = EbserverArgs::parse();

    // Initialize tracing, RUST_LOG wins over the level flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            args.log_directive()
                .unwrap_or_else(|| DEFAULT_LOG_DIRECTIVE.to_string()),
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.dev_mode {
        tracing::info!("Development mode: {}", args.dev_mode);
        println!(
            "{} Running in {} mode",
            &*CHECKMARK,
            console::style("development").yellow()
        );
    }

    // Create configuration from arguments and environment
    let config = Arc::new(ServerConfig::from_env(&args.host, args.port, args.dev_mode)?);

    // Connect to the sandbox engine
    let engine = Arc::new(DockerEngine::connect()?);
    let state = AppState::new(config.clone(), engine)?;
    let pool = state.get_pool().clone();

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_origin(Any);

    // Build application
    let app = route::create_router(state).layer(cors);

    // Start server
    tracing::info!("Starting server on {}", config.get_addr());
    println!(
        "{} Server listening on {} (executions at {})",
        &*CHECKMARK,
        console::style(config.get_addr()).yellow(),
        console::style(EXECUTE_WS_PATH).yellow()
    );

    let listener = tokio::net::TcpListener::bind(config.get_addr()).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Tear down the pooled sandboxes
    tracing::info!("Shutting down, removing sandboxes");
    pool.shutdown_all().await;
    println!("{} Sandboxes removed", &*CHECKMARK);

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
