//! Assistant conversation orchestrator
//!
//! Sits between a chat UI and an upstream assistant service: admits messages
//! under per-caller rate and token limits, keeps one upstream thread per
//! caller, streams the reply as it grows, and publishes a sanitized final
//! record with extracted citations.

mod api;
mod assembler;
mod config;
mod db;
mod error;
mod keyed_lock;
mod provider;
mod publisher;
mod quota;
mod runtime;
mod text;
mod threads;

use api::{create_router, AppState};
use assembler::AssemblerConfig;
use config::OrchestratorConfig;
use db::Database;
use provider::{AssistantProvider, LoggingProvider, OpenAiAssistantsProvider, OpenAiConfig};
use runtime::{DatabaseStorage, Orchestrator, OrchestratorLimits};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assistant_orchestrator=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = OrchestratorConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    // Replies cut off by a previous shutdown can never finish
    let interrupted = db.fail_interrupted_records()?;
    if interrupted > 0 {
        tracing::warn!(records = interrupted, "Marked interrupted replies as failed");
    }

    let (Some(api_key), Some(assistant_id)) =
        (config.openai_api_key.clone(), config.openai_assistant_id.clone())
    else {
        tracing::error!("No upstream configured. Set OPENAI_API_KEY and OPENAI_ASSISTANT_ID.");
        return Err("missing upstream credentials".into());
    };
    let upstream = OpenAiAssistantsProvider::new(OpenAiConfig {
        api_key,
        assistant_id,
        base_url: config.openai_base_url.clone(),
        request_timeout: config.upstream_request_timeout,
    })?;
    let provider: Arc<dyn AssistantProvider> = Arc::new(LoggingProvider::new(Arc::new(upstream)));

    let orchestrator = Orchestrator::new(
        DatabaseStorage::new(db),
        provider,
        OrchestratorLimits {
            rate_limit_per_window: config.rate_limit_per_window,
            rate_window: config.rate_window,
            daily_output_tokens: config.daily_output_tokens,
            max_output_tokens_per_request: config.max_output_tokens_per_request,
        },
        AssemblerConfig {
            poll_interval: config.poll_interval,
            run_timeout: config.run_timeout,
        },
    );
    tracing::info!(
        rate_limit = config.rate_limit_per_window,
        rate_window_secs = config.rate_window.as_secs(),
        daily_output_tokens = config.daily_output_tokens,
        max_output_tokens_per_request = config.max_output_tokens_per_request,
        "Orchestrator initialized"
    );

    let state = AppState::new(orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Assistant orchestrator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
