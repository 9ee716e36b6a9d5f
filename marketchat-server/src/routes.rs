//! HTTP surface: axum router, bearer authentication, and error mapping.
//!
//! Every route is keyed by a bearer credential; handlers stay thin and
//! delegate to the [`ChatService`]. The `/ws` route upgrades into the
//! realtime hub's connection lifecycle.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use marketchat_proto::ids::{ChatId, UserId};
use marketchat_proto::model::{Chat, MessageDraft};
use serde::{Deserialize, Serialize};

use crate::directory::UserDirectory;
use crate::hub::RealtimeHub;
use crate::service::{ChatService, ServiceError};
use crate::store::StoreError;

/// Shared application state behind every handler.
pub struct AppState {
    /// Identity resolver boundary.
    pub directory: Arc<UserDirectory>,
    /// Conversation orchestration.
    pub service: Arc<ChatService>,
    /// Realtime fanout.
    pub hub: Arc<RealtimeHub>,
}

/// Errors surfaced over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or malformed `Authorization: Bearer` header.
    #[error("missing bearer credential")]
    MissingCredential,
    /// The service rejected the request.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::MissingCredential => StatusCode::UNAUTHORIZED,
            Self::Service(service) => match service {
                ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
                ServiceError::Store(store) => match store {
                    StoreError::ChatNotFound | StoreError::UserNotFound => StatusCode::NOT_FOUND,
                    StoreError::Forbidden => StatusCode::FORBIDDEN,
                    StoreError::InvalidMessage(_) | StoreError::InvalidParticipants => {
                        StatusCode::BAD_REQUEST
                    }
                    StoreError::Conflict => StatusCode::CONFLICT,
                    StoreError::Transient => StatusCode::SERVICE_UNAVAILABLE,
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Request body for `POST /chats`.
#[derive(Debug, Deserialize)]
pub struct OpenChatRequest {
    /// Internal id of the other participant.
    pub recipient_id: UserId,
}

/// Response body for `PUT /chats/{chat_id}/read`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    /// Whether any message's read state changed.
    pub updated: bool,
}

/// Response body for `GET /chats/unread-count`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    /// Total unread messages across the caller's chats.
    pub count: u64,
}

/// Extracts the bearer credential from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::MissingCredential)
}

/// `GET /chats` — the caller's chats, most recently active first.
async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Chat>>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.service.list_chats(token).await?))
}

/// `POST /chats` — get or create the chat with a recipient.
async fn open_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OpenChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.service.open_chat(token, body.recipient_id).await?))
}

/// `GET /chats/{chat_id}` — a single chat, participants only.
async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<Chat>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.service.get_chat(token, chat_id).await?))
}

/// `POST /chats/{chat_id}/messages` — append a message; returns the
/// updated chat with the new message last.
async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
    Json(draft): Json<MessageDraft>,
) -> Result<Json<Chat>, ApiError> {
    let token = bearer_token(&headers)?;
    Ok(Json(state.service.send_message(token, chat_id, &draft).await?))
}

/// `PUT /chats/{chat_id}/read` — mark all messages read for the caller.
async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let updated = state.service.mark_read(token, chat_id).await?;
    Ok(Json(MarkReadResponse { updated }))
}

/// `GET /chats/unread-count` — total unread messages for the caller.
async fn unread_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let count = state.service.unread_count(token).await?;
    Ok(Json(UnreadCountResponse { count }))
}

/// `GET /ws` — upgrade into the realtime connection lifecycle.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| crate::socket::handle_socket(socket, state))
}

/// Builds the full router over the shared state.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/chats", axum::routing::get(list_chats).post(open_chat))
        .route("/chats/unread-count", axum::routing::get(unread_count))
        .route("/chats/{chat_id}", axum::routing::get(get_chat))
        .route("/chats/{chat_id}/messages", axum::routing::post(send_message))
        .route("/chats/{chat_id}/read", axum::routing::put(mark_read))
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}

/// Starts the server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code;
/// binding to port 0 picks an OS-assigned port.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    state: Arc<AppState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
