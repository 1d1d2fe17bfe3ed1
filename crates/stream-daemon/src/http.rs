use crate::core::DaemonEvent;
use crate::player::validate_url;
use crate::store::{SharedDatabase, StoreError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stream_proto::protocol::{Command, Entry, EntryKey, ErrorKind, PlaybackState, TableKind};
use stream_proto::state::StateManager;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub store: SharedDatabase,
    pub event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Deserialize)]
struct PlayRequest {
    url: String,
}

#[derive(Deserialize)]
struct FavoriteRequest {
    url: String,
    name: String,
    #[serde(default)]
    count: Option<i64>,
}

#[derive(Serialize)]
struct Created {
    id: i64,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: Option<ErrorKind>,
    message: String,
}

/// Handler failure rendered as a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: Option<ErrorKind>,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: None,
            message: message.into(),
        }
    }

    fn rejected(kind: ErrorKind) -> Self {
        let status = match kind {
            ErrorKind::DuplicateName | ErrorKind::DuplicateUrl => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            kind: Some(kind),
            message: kind.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e.kind() {
            Some(kind) => ApiError::rejected(kind),
            None => {
                error!("HTTP API: store error: {}", e);
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.kind,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play", post(play))
        .route("/api/stop", post(stop))
        .route("/api/ack", post(acknowledge))
        .route("/api/recents", get(list_recents))
        .route("/api/recents/:id", axum::routing::delete(delete_recent))
        .route("/api/favorites", get(list_favorites).post(add_favorite))
        .route(
            "/api/favorites/:id",
            put(update_favorite).delete(delete_favorite),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: Command) -> Result<StatusCode, ApiError> {
    state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .map_err(|_| ApiError::internal("daemon event loop is gone"))?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_state(State(state): State<HttpState>) -> Json<PlaybackState> {
    Json(state.state_manager.get_state().await)
}

async fn play(
    State(state): State<HttpState>,
    Json(req): Json<PlayRequest>,
) -> Result<StatusCode, ApiError> {
    info!("HTTP API: Play {}", req.url);
    let url = validate_url(&req.url)
        .map_err(|e| ApiError::rejected(e.kind()))?
        .to_string();
    send(&state, Command::Play { url }).await
}

async fn stop(State(state): State<HttpState>) -> Result<StatusCode, ApiError> {
    info!("HTTP API: Stop");
    send(&state, Command::Stop).await
}

async fn acknowledge(State(state): State<HttpState>) -> Result<StatusCode, ApiError> {
    send(&state, Command::Acknowledge).await
}

fn list(state: &HttpState, table: TableKind) -> Result<Json<Vec<Entry>>, ApiError> {
    let entries = state.store.lock().table(table).get_all()?;
    Ok(Json(entries))
}

async fn list_recents(State(state): State<HttpState>) -> Result<Json<Vec<Entry>>, ApiError> {
    list(&state, TableKind::Recents)
}

async fn list_favorites(State(state): State<HttpState>) -> Result<Json<Vec<Entry>>, ApiError> {
    list(&state, TableKind::Favorites)
}

fn delete_entry(state: &HttpState, table: TableKind, id: i64) -> Result<StatusCode, ApiError> {
    state.store.lock().table(table).delete(&EntryKey::Id(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_recent(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    delete_entry(&state, TableKind::Recents, id)
}

async fn delete_favorite(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    delete_entry(&state, TableKind::Favorites, id)
}

async fn add_favorite(
    State(state): State<HttpState>,
    Json(req): Json<FavoriteRequest>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let outcome = state
        .store
        .lock()
        .favorites()
        .insert(&req.url, Some(&req.name))?;
    info!("HTTP API: favorite {} saved as id {}", req.name, outcome.id());
    Ok((StatusCode::CREATED, Json(Created { id: outcome.id() })))
}

async fn update_favorite(
    State(state): State<HttpState>,
    Path(id): Path<i64>,
    Json(req): Json<FavoriteRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .lock()
        .favorites()
        .update(id, &req.url, Some(&req.name), req.count)?;
    Ok(StatusCode::NO_CONTENT)
}
