//! Axum + Askama surface over the sync and purge pipelines.

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use inboxmeta_adapters::ProviderError;
use inboxmeta_core::Credential;
use inboxmeta_storage::StoreError;
use inboxmeta_sync::{IngestError, InboxSync, PurgeError, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "inboxmeta-web";

const SENDER_REQUIRED: &str = "sender required";

/// Shared handler state. The credential slot replaces a per-user session.
pub struct AppState {
    pub sync: InboxSync,
    credential: RwLock<Option<Arc<Credential>>>,
}

impl AppState {
    pub fn new(sync: InboxSync, credential: Option<Credential>) -> Self {
        Self {
            sync,
            credential: RwLock::new(credential.map(Arc::new)),
        }
    }

    async fn credential(&self) -> Result<Arc<Credential>, WebError> {
        self.credential
            .read()
            .await
            .clone()
            .filter(|c| c.is_usable())
            .ok_or(WebError::Unauthorized)
    }

    async fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write().await = credential.map(Arc::new);
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("not authenticated")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Sync(#[from] IngestError),
    #[error(transparent)]
    Purge(#[from] PurgeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("rendering template: {0}")]
    Render(#[from] askama::Error),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let unauthorized = || {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "not authenticated"})),
            )
                .into_response()
        };

        match self {
            Self::Unauthorized => unauthorized(),
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
            }
            Self::Sync(err) if err.is_unauthorized() => unauthorized(),
            // The handler rejects blank senders first; this covers other callers.
            Self::Purge(PurgeError::MissingSender) => {
                Self::BadRequest(SENDER_REQUIRED).into_response()
            }
            Self::Purge(err) if err.is_unauthorized() => unauthorized(),
            Self::Purge(err) => {
                error!(error = %err, "delete_sender failed");
                let status = match err {
                    PurgeError::Remote { .. } => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    Json(json!({"error": "delete failed", "deleted": err.deleted()})),
                )
                    .into_response()
            }
            Self::Provider(err) if err.is_unauthorized() => unauthorized(),
            Self::Provider(err) => {
                error!(error = %err, "provider request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "provider request failed"})),
                )
                    .into_response()
            }
            other => {
                error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    processed: usize,
    inserted: u64,
    elapsed_s: f64,
}

#[derive(Debug, Deserialize)]
struct DeleteSenderBody {
    #[serde(default)]
    sender: Option<String>,
}

#[derive(Debug, Clone)]
struct SenderRow {
    sender: String,
    count: u64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    connected: bool,
    total_messages: u64,
    limit: usize,
    senders: Vec<SenderRow>,
}

pub fn app(state: AppState) -> Router {
    let cors = cors_layer(state.sync.config().frontend_origin.as_deref());
    let router = Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/sync", get(sync_handler).post(sync_handler))
        .route("/top_senders", get(top_senders_handler))
        .route("/delete_sender", post(delete_sender_handler))
        .route("/profile", get(profile_handler))
        .route("/connect", get(connect_handler))
        .route("/disconnect", get(disconnect_handler))
        .with_state(Arc::new(state));
    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Lets the browser frontend call the API with its session cookies.
fn cors_layer(origin: Option<&str>) -> Option<CorsLayer> {
    let origin = origin?;
    let origin = match HeaderValue::from_str(origin) {
        Ok(value) => value,
        Err(err) => {
            warn!(origin, error = %err, "ignoring unusable frontend origin");
            return None;
        }
    };
    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
            .allow_credentials(true),
    )
}

/// Builds the sync context from env/config, starts the optional scheduler and
/// serves until the listener fails.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = config.web_port;
    let sync = InboxSync::from_config(config).await?;

    let credential = match sync.load_credential() {
        Ok(credential) => Some(credential),
        Err(err) => {
            warn!(error = %err, "starting without a credential");
            None
        }
    };

    let scheduler = sync.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %sync.config().sync_cron, "scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(sync, credential))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Result<Response, WebError> {
    let store = state.sync.store();
    let limit = state.sync.config().top_senders_limit;
    let senders = state
        .sync
        .top_senders()
        .await?
        .into_iter()
        .map(|a| SenderRow {
            sender: a.sender,
            count: a.count,
        })
        .collect();
    let tpl = IndexTemplate {
        connected: state.credential().await.is_ok(),
        total_messages: store.count().await?,
        limit,
        senders,
    };
    Ok(Html(tpl.render()?).into_response())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Result<Json<SyncResponse>, WebError> {
    let credential = state.credential().await?;
    let summary = state.sync.run_sync(credential).await?;
    Ok(Json(SyncResponse {
        processed: summary.processed,
        inserted: summary.inserted,
        elapsed_s: summary.elapsed_s,
    }))
}

async fn top_senders_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<(String, u64)>>, WebError> {
    let rows = state.sync.top_senders().await?;
    Ok(Json(rows.into_iter().map(|a| (a.sender, a.count)).collect()))
}

async fn delete_sender_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, WebError> {
    let credential = state.credential().await?;
    let body: DeleteSenderBody =
        serde_json::from_slice(&body).map_err(|_| WebError::BadRequest("invalid JSON body"))?;
    let sender = body
        .sender
        .filter(|s| !s.trim().is_empty())
        .ok_or(WebError::BadRequest(SENDER_REQUIRED))?;

    let summary = state.sync.delete_sender(&credential, &sender).await?;
    Ok(Json(json!({"deleted": summary.deleted})))
}

async fn profile_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, WebError> {
    let credential = state.credential().await?;
    let email = state.sync.provider().profile_email(&credential).await?;
    Ok(Json(json!({"email": email})))
}

/// Rereads the credential bundle from disk.
async fn connect_handler(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, WebError> {
    match state.sync.load_credential() {
        Ok(credential) => {
            state.set_credential(Some(credential)).await;
            Ok(Json(json!({"connected": true})))
        }
        Err(err) => {
            warn!(error = %err, "credential reload failed");
            Err(WebError::Unauthorized)
        }
    }
}

async fn disconnect_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.set_credential(None).await;
    Json(json!({"connected": false}))
}
