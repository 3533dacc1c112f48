//! HTTP server implementation using Axum.

use crate::registry::RoomInfo;
use crate::sandbox::{RunOutcome, SandboxError};
use crate::session::drive_connection;
use crate::signed_url::SignedUrlError;
use crate::state::AppState;
use crate::ticket::{Scope, TicketError};
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const MAX_ROOM_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TicketError> for ApiError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::Malformed => Self::Unauthorized(err.to_string()),
            _ => Self::Forbidden(err.to_string()),
        }
    }
}

impl From<SignedUrlError> for ApiError {
    fn from(err: SignedUrlError) -> Self {
        match err {
            SignedUrlError::InvalidName => Self::BadRequest(err.to_string()),
            SignedUrlError::NotFound => Self::NotFound(err.to_string()),
            SignedUrlError::Expired | SignedUrlError::BadSignature => {
                Self::Forbidden(err.to_string())
            }
            SignedUrlError::RateLimited => Self::RateLimited,
            SignedUrlError::BaseUrl(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::UnsupportedLanguage(_) => Self::BadRequest(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

// Request/Response types
#[derive(Debug, Deserialize)]
struct WsQuery {
    ticket: Option<String>,
    room: Option<String>,
    #[serde(default)]
    elevated: bool,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    code: String,
    language: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    file_id: String,
    expires: u64,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct TicketQuery {
    ticket: Option<String>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Interactive rooms
        .route("/ws", get(ws_default_room))
        .route("/ws/:room", get(ws_named_room))
        .route("/rooms", get(list_rooms))
        .route("/rooms/:room", get(get_room).delete(delete_room))
        // Stateless run
        .route("/execute", post(execute))
        // Artifacts
        .route("/files/download", get(download))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the application on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);
    serve(listener, state).await
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_default_room(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    admit(state, None, query, ws)
}

async fn ws_named_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    admit(state, Some(room), query, ws)
}

/// Ticket admission, done before the upgrade so rejected clients get a
/// plain HTTP status.
fn admit(
    state: AppState,
    path_room: Option<String>,
    query: WsQuery,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query
        .ticket
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("missing ticket".to_string()))?;
    let claims = state.tickets.decode(token).map_err(|e| {
        warn!(error = %e, "rejected websocket ticket");
        ApiError::from(e)
    })?;

    let room = path_room
        .or(query.room)
        .unwrap_or_else(|| claims.room.clone());
    if room.is_empty() || room.len() > MAX_ROOM_LEN {
        return Err(ApiError::BadRequest("invalid room id".to_string()));
    }
    let claims = state.tickets.verify(token, &room).map_err(|e| {
        warn!(room, subject = %claims.sub, error = %e, "rejected websocket ticket");
        ApiError::from(e)
    })?;
    if query.elevated && !claims.has_scope(Scope::Elevated) {
        warn!(room, subject = %claims.sub, "elevated join without elevated scope");
        return Err(TicketError::MissingScope(Scope::Elevated).into());
    }

    info!(room, subject = %claims.sub, elevated = query.elevated, "websocket admitted");
    let elevated = query.elevated;
    Ok(ws.on_upgrade(move |socket| drive_connection(socket, state.rooms, room, elevated)))
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomInfo>> {
    Json(state.rooms.rooms())
}

async fn get_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Result<Json<RoomInfo>, ApiError> {
    state
        .rooms
        .room(&room)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("room {room} not found")))
}

/// Terminate a room. Needs an elevated ticket for that room.
async fn delete_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(query): Query<TicketQuery>,
) -> Result<StatusCode, ApiError> {
    let token = query
        .ticket
        .as_deref()
        .ok_or_else(|| ApiError::Unauthorized("missing ticket".to_string()))?;
    let claims = state.tickets.verify(token, &room)?;
    if !claims.has_scope(Scope::Elevated) {
        warn!(room, subject = %claims.sub, "room delete without elevated scope");
        return Err(TicketError::MissingScope(Scope::Elevated).into());
    }
    if state.rooms.terminate(&room).await {
        info!(room, subject = %claims.sub, "room terminated");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("room {room} not found")))
    }
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    info!(
        language = %req.language,
        user_id = ?req.user_id,
        bytes = req.code.len(),
        "POST /execute"
    );
    let outcome = state.launcher.run_oneshot(&req.code, &req.language).await?;
    info!(success = outcome.is_success(), "POST /execute - done");
    Ok(Json(outcome))
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let client = peer.ip().to_string();
    let path = state
        .urls
        .authorize_download(&client, &query.file_id, &query.signature, query.expires)
        .map_err(|e| {
            warn!(client, file = %query.file_id, error = %e, "download refused");
            ApiError::from(e)
        })?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::from(SignedUrlError::NotFound))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .len();
    info!(client, file = %query.file_id, len, "serving download");

    let body = Body::from_stream(ReaderStream::new(file));
    let disposition = format!("attachment; filename=\"{}\"", query.file_id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        body,
    )
        .into_response())
}
