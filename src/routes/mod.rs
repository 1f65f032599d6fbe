//! API routes

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::conversation::{ConversationName, Message};
use crate::core::{ChannelSink, TurnController};
use crate::history::{recent_conversations, HistoryError, INDEX_LIMIT};
use crate::session::Session;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TurnController>,
    pub session: Arc<Mutex<Session>>,
}

impl AppState {
    pub fn new(controller: TurnController) -> Self {
        Self {
            controller: Arc::new(controller),
            session: Arc::new(Mutex::new(Session::new())),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub identifier: String,
    pub label: String,
    pub message_count: usize,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    removed: usize,
}

#[derive(Debug, Serialize)]
struct SessionView {
    identifier: Option<String>,
    messages: Vec<Message>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            identifier: session.name().map(|n| n.to_string()),
            messages: session.messages().to_vec(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub identifier: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Errors surfaced to API clients
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("A reply is still streaming")]
    Busy,

    #[error("Message is empty")]
    EmptyMessage,

    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::EmptyMessage => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::History(HistoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::History(
                HistoryError::CorruptData { .. } | HistoryError::InvalidIdentifier(_),
            ) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_history(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let recent =
        recent_conversations(state.controller.history().as_ref(), INDEX_LIMIT).await?;
    let entries = recent
        .into_iter()
        .map(|c| HistoryEntry {
            identifier: c.name.to_string(),
            label: c.label().to_string(),
            message_count: c.messages.len(),
        })
        .collect();
    Ok(Json(entries))
}

async fn clear_history(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let mut session = state.session.try_lock().map_err(|_| ApiError::Busy)?;
    let removed = state.controller.history().delete_all().await?;
    session.reset();
    info!("Cleared {} stored conversation(s)", removed);
    Ok(Json(ClearResponse { removed }))
}

async fn get_session(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    let session = state.session.try_lock().map_err(|_| ApiError::Busy)?;
    Ok(Json(SessionView::from(&*session)))
}

async fn new_session(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    let mut session = state.session.try_lock().map_err(|_| ApiError::Busy)?;
    session.reset();
    debug!("Started a new conversation");
    Ok(Json(SessionView::from(&*session)))
}

async fn select_session(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let name = ConversationName::parse(&request.identifier)
        .ok_or_else(|| HistoryError::InvalidIdentifier(request.identifier.clone()))?;

    let mut session = state.session.try_lock().map_err(|_| ApiError::Busy)?;
    let messages = state.controller.history().load_conversation(&name).await?;
    session.restore(name, messages);
    Ok(Json(SessionView::from(&*session)))
}

/// Run one turn, streaming its events as SSE. The session stays locked until
/// the turn ends; a client that disconnects cancels the turn.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    let mut session = state
        .session
        .clone()
        .try_lock_owned()
        .map_err(|_| ApiError::Busy)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = state.controller.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        // Outcome is already reported through the sink.
        let _ = controller
            .submit(&mut session, &request.message, &mut sink)
            .await;
        // Unlock before the event stream ends so the client's next request
        // finds the session free.
        drop(session);
        drop(sink);
    });

    let events = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Event::default().event(event.name()).json_data(&event);
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/history", get(list_history).delete(clear_history))
        .route("/v1/session", get(get_session))
        .route("/v1/session/new", post(new_session))
        .route("/v1/session/select", post(select_session))
        .route("/v1/chat", post(chat))
}
