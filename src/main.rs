//! Counsel Chat - single-user counselling chat service
//!
//! Streams replies from an LLM under a fixed counsellor persona and keeps
//! each conversation as a pretty-printed JSON file (or a SQLite row) so it
//! can be picked up again later.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod history;
mod providers;
mod routes;
mod session;

use config::{prompts::resolve_persona, Config, HistoryBackend};
use core::TurnController;
use history::{HistoryStore, JsonDirStore, SqliteHistoryStore};
use providers::Provider;
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "counsel_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let provider = Provider::from_config(&config)?;
    tracing::info!("Using provider '{}' with model '{}'", config.provider, config.model);

    let store: Arc<dyn HistoryStore> = match config.history_backend {
        HistoryBackend::Json => {
            tracing::info!("History directory: {}", config.history_dir.display());
            Arc::new(JsonDirStore::new(&config.history_dir))
        }
        HistoryBackend::Sqlite => {
            tracing::info!("History database: {}", config.sqlite_path.display());
            Arc::new(SqliteHistoryStore::new(&config.sqlite_path).await?)
        }
    };

    let persona = resolve_persona(config.persona_file.as_deref()).await?;

    let controller = TurnController::new(Arc::new(provider), store, persona)
        .with_model(config.model.clone())
        .with_max_messages(config.max_messages)
        .with_rejection_warning(config.rejection_warning.clone());

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(controller));

    tracing::info!("Counsel chat running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
