//! JSON API over the spekkoper runner.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use spek_core::{Listing, Query, QueryId};
use spek_sync::{RegisterQuery, Runner, SyncError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub mod auth;

pub use auth::{AuthError, AuthorizerClient, AuthorizerConfig, IdentityClient, UserId};

pub const CRATE_NAME: &str = "spek-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    pub identity: Option<Arc<dyn IdentityClient>>,
}

impl AppState {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self {
            runner,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityClient>) -> Self {
        self.identity = Some(identity);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub authorizer: Option<AuthorizerConfig>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("SPEK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            authorizer: AuthorizerConfig::from_env(),
        }
    }

    /// Builds the configured identity client, failing on a bad configuration.
    pub fn identity_client(&self) -> Result<Option<Arc<dyn IdentityClient>>, AuthError> {
        let Some(config) = &self.authorizer else {
            return Ok(None);
        };
        let client = AuthorizerClient::new(reqwest::Client::new(), config)?;
        Ok(Some(Arc::new(client)))
    }
}

#[derive(Debug)]
pub enum ApiError {
    Sync(SyncError),
    Auth(AuthError),
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Sync(SyncError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Sync(SyncError::FetchFailed(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Sync(SyncError::PersistFailed(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sync(SyncError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Sync(SyncError::TimedOut(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Auth(err) if err.is_unauthenticated() => StatusCode::UNAUTHORIZED,
            ApiError::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Sync(err) => err.to_string(),
            ApiError::Auth(err) => err.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message(), "request failed");
        }
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct QueryList {
    queries: Vec<Query>,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    listings: Vec<Listing>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    data: WebhookUser,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookUser {
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let queries = Router::new()
        .route("/query", post(create_query_handler).get(list_queries_handler))
        .route(
            "/query/{id}",
            get(get_query_handler).delete(delete_query_handler),
        )
        .route("/query/{id}/run", post(run_query_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_identity,
        ));

    Router::new()
        .merge(queries)
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn create_query_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterQuery>, JsonRejection>,
) -> Result<(StatusCode, Json<Query>), ApiError> {
    let Json(request) = payload?;
    let query = state.runner.register(request).await?;
    Ok((StatusCode::CREATED, Json(query)))
}

async fn list_queries_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueryList>, ApiError> {
    let queries = state.runner.list().await?;
    Ok(Json(QueryList { queries }))
}

async fn get_query_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Query>, ApiError> {
    Ok(Json(state.runner.get(&QueryId::from(id)).await?))
}

async fn delete_query_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.runner.delete(&QueryId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_query_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let outcome = state.runner.run(&QueryId::from(id)).await?;
    Ok(Json(RunResponse {
        listings: outcome.new_listings,
    }))
}

async fn webhook_handler(body: Bytes) -> Response {
    info!(payload = %String::from_utf8_lossy(&body), "webhook payload received");
    match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => {
            info!(
                username = %payload.data.username,
                email = %payload.data.email,
                "new user registered"
            );
            StatusCode::OK.into_response()
        }
        Err(err) => ApiError::BadRequest(format!("unreadable webhook payload: {err}")).into_response(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
