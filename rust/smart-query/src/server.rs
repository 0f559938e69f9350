//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderValue, StatusCode};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::{AppConfig, ServerConfig};
use crate::database::{ClickHouseClient, DatabaseClient};
use crate::embedding::create_embedder;
use crate::llm::LlmSettings;
use crate::llm::providers::create_provider;
use crate::logging::OpTimer;
use crate::pipeline::QueryOrchestrator;
use crate::{AppState, log_banner, log_init_step, log_init_warning, log_success};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const INIT_STEPS: u32 = 6;

/// Create the application with all routes and middleware.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("Smart Query v{VERSION}"),
        format!(
            "Dialect: {} | Embeddings: {:?}",
            config.validator.dialect.display_name(),
            config.embedding.provider
        )
    );

    // [1/6] LLM provider
    let step_timer = OpTimer::new("server", "llm_provider");
    let llm_settings = LlmSettings::from_config(&config)?;
    let provider_info = format!(
        "{} ({}) {}",
        llm_settings.provider.as_str(),
        llm_settings.model,
        if llm_settings.api_key.is_some() {
            "✓"
        } else {
            "✗ No API key"
        }
    );
    let llm = create_provider(llm_settings)?;
    log_init_step!(1, INIT_STEPS, "LLM Provider", provider_info);
    step_timer.finish();

    // [2/6] Embedding provider
    let step_timer = OpTimer::new("server", "embedding_provider");
    let embedder = create_embedder(&config)?;
    log_init_step!(
        2,
        INIT_STEPS,
        "Embeddings",
        format!("{} ({} dims)", embedder.name(), embedder.dimension())
    );
    step_timer.finish();

    // [3/6] Database client
    let step_timer = OpTimer::new("server", "database");
    let database: Arc<dyn DatabaseClient> = Arc::new(ClickHouseClient::new(config.database.clone())?);
    log_init_step!(
        3,
        INIT_STEPS,
        "Database",
        format!("ClickHouse {} / {}", config.database.url(), config.database.database)
    );
    step_timer.finish();

    // [4/6] Orchestrator
    let step_timer = OpTimer::new("server", "orchestrator");
    let pipeline = Arc::new(QueryOrchestrator::new(config.clone(), database, llm, embedder));
    pipeline.spawn_invalidation();
    log_init_step!(4, INIT_STEPS, "Orchestrator", "Pipeline ready");
    step_timer.finish();

    // [5/6] Schema warm-up; requests refresh lazily if this fails
    let step_timer = OpTimer::new("server", "schema_warmup");
    match pipeline.refresh_schema().await {
        Ok(summary) => {
            log_init_step!(
                5,
                INIT_STEPS,
                "Schema",
                format!(
                    "revision {} ({} tables, {} entities)",
                    summary.revision, summary.tables, summary.entities
                )
            );
        }
        Err(e) => {
            log_init_warning!("Schema warm-up failed: {}. Will retry on first request.", e);
            log_init_step!(5, INIT_STEPS, "Schema", "Deferred");
        }
    }
    step_timer.finish();

    // [6/6] Router
    let step_timer = OpTimer::new("server", "router");
    let state = AppState::new(config, pipeline);
    let app = build_router(state);
    log_init_step!(6, INIT_STEPS, "Router", "Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Smart Query server created successfully");

    Ok(app)
}

/// Routes and middleware around an existing state.
pub fn build_router(state: AppState) -> Router {
    let server = &state.config.server;
    let cors = cors_layer(server);
    let timeout = Duration::from_secs(server.timeout_secs);

    api::create_router()
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                log_init_warning!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}
