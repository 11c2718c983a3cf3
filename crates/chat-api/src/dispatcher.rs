//! Request dispatcher
//!
//! One logical call moves through:
//!
//! ```text
//! Sent -> Success | ServerError | NetworkError | ParseError
//!      -> 401 -> refresh -> Resent -> Success | ServerError | AuthExpired
//! ```
//!
//! The 401 path only applies when a bearer token was attached and the call's
//! [`RetryPolicy`](crate::RetryPolicy) allows it. The refresh goes through the session's
//! single-flight gate, so any number of concurrent 401s cost one backend
//! refresh. When the refresh fails, the resent request is rejected again, or
//! the session was cleared before the resend went out, the caller gets
//! `AuthExpired` and the session is left cleared.

use chat_auth::{AuthSession, ME_PATH, UserId, endpoint_url};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{ApiError, Result, server_error};
use crate::metrics::{record_auth_retry, record_outcome};
use crate::request::{Body, RequestContext, RequestOptions};

/// Profile returned by `GET /auth/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Fields this client does not model
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Sends requests on behalf of the current session.
#[derive(Clone)]
pub struct ApiClient {
    session: AuthSession,
}

impl ApiClient {
    pub fn new(session: AuthSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// Send a request to `endpoint` (a path under the backend base URL) and
    /// parse the 2xx body into `T`. An empty body parses as JSON `null`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let ctx = RequestContext::new(endpoint, options);
        let result = self.dispatch(ctx).await.and_then(|body| parse_body(&body));
        record_outcome(&result);
        result
    }

    /// [`execute`](Self::execute) for callers that want the untyped JSON.
    pub async fn execute_json(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<serde_json::Value> {
        self.execute(endpoint, options).await
    }

    /// The signed-in user's profile.
    pub async fn me(&self) -> Result<UserProfile> {
        self.execute(ME_PATH, RequestOptions::get()).await
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id, method = %ctx.options.method, endpoint = %ctx.endpoint))]
    async fn dispatch(&self, mut ctx: RequestContext) -> Result<Vec<u8>> {
        loop {
            let access = self.session.credentials().await.map(|c| c.access_token);
            if ctx.retried() && access.is_none() {
                warn!("session cleared before resend, not sending unauthenticated");
                self.session.clear().await;
                return Err(ApiError::AuthExpired);
            }
            let response = self.send(&ctx, access.as_deref()).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED
                && let Some(rejected) = access
            {
                if ctx.can_retry() {
                    debug!("access token rejected, refreshing");
                    if self.session.refresh_rejected(&rejected).await {
                        ctx.mark_retried();
                        record_auth_retry();
                        debug!("resending with refreshed token");
                        continue;
                    }
                    warn!("token refresh failed, clearing session");
                    self.session.clear().await;
                    return Err(ApiError::AuthExpired);
                }
                if ctx.retried() {
                    warn!("refreshed token rejected, clearing session");
                    self.session.clear().await;
                    return Err(ApiError::AuthExpired);
                }
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::Network(format!("failed to read response body: {e}")))?;

            if !status.is_success() {
                debug!(status = status.as_u16(), "request failed");
                return Err(server_error(status, &body));
            }
            debug!(status = status.as_u16(), retried = ctx.retried(), "request succeeded");
            return Ok(body.to_vec());
        }
    }

    async fn send(&self, ctx: &RequestContext, access: Option<&str>) -> Result<reqwest::Response> {
        let url = endpoint_url(self.session.base_url(), &ctx.endpoint);
        let mut headers = ctx.options.headers.clone();
        if access.is_some() {
            headers.remove(AUTHORIZATION);
        }

        let mut request = self
            .session
            .http_client()
            .request(ctx.options.method.clone(), url)
            .headers(headers);
        if let Some(access) = access {
            request = request.bearer_auth(access);
        }
        request = match &ctx.options.body {
            Body::Empty => request,
            Body::Json(value) => request.json(value),
            Body::Raw { content_type, data } => request
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
        };

        request.send().await.map_err(|e| {
            warn!(error = %e, "request did not reach the backend");
            ApiError::Network(e.to_string())
        })
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::Parse(e.to_string()))
}
