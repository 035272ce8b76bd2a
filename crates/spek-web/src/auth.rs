//! Bearer-token identity for the query routes, backed by an Authorizer
//! (authorizer.dev) GraphQL endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{ApiError, AppState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserId(pub String);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token not valid")]
    InvalidToken,
    #[error("could not validate the token: {0}")]
    Validation(String),
    #[error("could not get user profile: {0}")]
    Profile(String),
    #[error("invalid authorizer configuration: {0}")]
    Config(String),
}

impl AuthError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::Validation(_)
        )
    }
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    pub url: String,
    pub client_id: String,
    pub redirect_url: String,
}

impl AuthorizerConfig {
    /// `None` when `AUTHORIZER_URL` is unset, which leaves the API open.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("AUTHORIZER_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        Some(Self {
            url,
            client_id: std::env::var("AUTHORIZER_CLIENT_ID").unwrap_or_default(),
            redirect_url: std::env::var("AUTHORIZER_REDIRECT_URL").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ValidateData {
    validate_jwt_token: ValidateResult,
}

#[derive(Debug, Deserialize)]
struct ValidateResult {
    is_valid: bool,
}

#[derive(Debug, Deserialize)]
struct ProfileData {
    profile: Profile,
}

#[derive(Debug, Deserialize)]
struct Profile {
    id: String,
}

const VALIDATE_JWT_QUERY: &str = "query validateJwt($params: ValidateJWTTokenInput!) { validate_jwt_token(params: $params) { is_valid } }";
const PROFILE_QUERY: &str = "query { profile { id email } }";

pub struct AuthorizerClient {
    client: reqwest::Client,
    graphql_url: reqwest::Url,
    client_id: String,
}

impl AuthorizerClient {
    pub fn new(client: reqwest::Client, config: &AuthorizerConfig) -> Result<Self, AuthError> {
        let base = reqwest::Url::parse(&config.url)
            .map_err(|err| AuthError::Config(format!("{}: {err}", config.url)))?;
        let graphql_url = base
            .join("graphql")
            .map_err(|err| AuthError::Config(err.to_string()))?;
        if config.client_id.trim().is_empty() {
            return Err(AuthError::Config("AUTHORIZER_CLIENT_ID is empty".into()));
        }
        info!(url = %graphql_url, redirect_url = %config.redirect_url, "authorizer client configured");
        Ok(Self {
            client,
            graphql_url,
            client_id: config.client_id.clone(),
        })
    }

    pub fn graphql_url(&self) -> &reqwest::Url {
        &self.graphql_url
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        body: serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<T, String> {
        let mut request = self
            .client
            .post(self.graphql_url.clone())
            .header("x-authorizer-client-id", &self.client_id)
            .json(&body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|err| err.to_string())?;
        let status = response.status();
        let payload: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|err| format!("{status}: {err}"))?;
        if let Some(first) = payload.errors.first() {
            return Err(first.message.clone());
        }
        payload
            .data
            .ok_or_else(|| format!("{status}: response without data"))
    }
}

pub fn validate_request_body(token: &str) -> serde_json::Value {
    json!({
        "query": VALIDATE_JWT_QUERY,
        "variables": { "params": { "token_type": "id_token", "token": token } },
    })
}

#[async_trait]
impl IdentityClient for AuthorizerClient {
    async fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        let validated: ValidateData = self
            .graphql(validate_request_body(token), None)
            .await
            .map_err(AuthError::Validation)?;
        if !validated.validate_jwt_token.is_valid {
            return Err(AuthError::InvalidToken);
        }

        let profile: ProfileData = self
            .graphql(json!({ "query": PROFILE_QUERY }), Some(token))
            .await
            .map_err(AuthError::Profile)?;
        Ok(UserId(profile.profile.id))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Rejects requests without a valid bearer token when an identity client is
/// configured; the resolved [`UserId`] is stored in the request extensions.
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(identity) = state.identity.clone() else {
        return next.run(request).await;
    };
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        return ApiError::from(AuthError::MissingToken).into_response();
    };

    match identity.validate(&token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => {
            warn!(error = %err, "request rejected by identity check");
            ApiError::from(err).into_response()
        }
    }
}
