//! Session authentication against the external identity service.
//!
//! The client names its volume with a URI whose query string carries the
//! session token (`/<volume_id>?session_id=<token>`). Every connection
//! re-validates its token with one round trip; nothing is cached, so a
//! revoked session stops working at the next connection.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no session_id in request")]
    MissingToken,

    #[error("session rejected by identity service: {0}")]
    InvalidSession(String),

    #[error("identity service unreachable: {0}")]
    Unreachable(String),

    #[error("invalid identity service response: {0}")]
    Json(#[from] serde_json::Error),
}

/// A validated session. Valid only for the RPCs made on behalf of this
/// connection; never cached or renewed.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub token: String,
    pub principal: String,
}

/// Collaborator contract: validate a session token, yielding the principal
/// it belongs to.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn validate_session(&self, token: &str) -> Result<String, AuthError>;
}

/// Authenticate a connection from its export URI.
///
/// Extracts the `session_id` query parameter and performs one validation
/// round trip. Runs before volume resolution and before any control-plane
/// call.
pub async fn authenticate(
    identity: &dyn IdentityService,
    uri: &Url,
) -> Result<SessionIdentity, AuthError> {
    let token = uri
        .query_pairs()
        .find(|(k, _)| k == "session_id")
        .map(|(_, v)| v.into_owned())
        .ok_or(AuthError::MissingToken)?;

    let principal = identity.validate_session(&token).await?;
    debug!(principal, "session validated");

    Ok(SessionIdentity { token, principal })
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    principal: String,
}

/// HTTP client for the identity service (`POST /session/validate`).
pub struct HttpIdentityService {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
}

impl HttpIdentityService {
    pub fn new(base: Url) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base: base.as_str().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn validate_session(&self, token: &str) -> Result<String, AuthError> {
        let payload = serde_json::to_vec(&ValidateRequest { session_id: token })?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/session/validate", self.base))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?
            .to_bytes();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidSession(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        if !status.is_success() {
            return Err(AuthError::Unreachable(format!(
                "identity service returned HTTP {status}"
            )));
        }

        let parsed: ValidateResponse = serde_json::from_slice(&body)?;
        Ok(parsed.principal)
    }
}
