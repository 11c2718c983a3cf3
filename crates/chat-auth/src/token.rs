//! Calls against the backend auth endpoints
//!
//! Login, register and refresh all answer with the same token payload.
//! Refresh authenticates with the refresh token as a Bearer credential and
//! may or may not rotate the refresh token; when `refresh_token` is absent
//! the caller keeps the one it already has.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, REGISTER_PATH, endpoint_url};
use crate::credentials::UserId;
use crate::error::{Error, Result};

/// Token payload returned by login, register and refresh.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub must_change_password: bool,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
}

/// Account creation payload for `POST /auth/register`.
#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
}

/// Exchange a username and password for a token pair.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint_url(base_url, LOGIN_PATH))
        .json(&LoginBody { username, password })
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    read_token_response(response, "login").await
}

/// Create an account. A successful registration signs the user in.
pub async fn register(
    client: &reqwest::Client,
    base_url: &str,
    request: &RegisterRequest<'_>,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint_url(base_url, REGISTER_PATH))
        .json(request)
        .send()
        .await
        .map_err(|e| Error::Http(format!("register request failed: {e}")))?;

    read_token_response(response, "register").await
}

/// Obtain a new access token using the refresh token.
///
/// 401/403 mean the refresh token is revoked, expired or already rotated.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint_url(base_url, REFRESH_PATH))
        .bearer_auth(refresh)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    read_token_response(response, "refresh").await
}

/// Invalidate the session server-side.
pub async fn logout(client: &reqwest::Client, base_url: &str, access: &str) -> Result<()> {
    let response = client
        .post(endpoint_url(base_url, LOGOUT_PATH))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::TokenEndpoint(format!("logout returned {status}")));
    }
    debug!("server-side session invalidated");
    Ok(())
}

async fn read_token_response(response: reqwest::Response, call: &str) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "{call} rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenEndpoint(format!(
            "{call} returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenEndpoint(format!("invalid {call} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_full_payload() {
        let json = r#"{
            "access_token": "A1",
            "refresh_token": "R1",
            "token_type": "bearer",
            "expires_in": 3600,
            "user_id": 42,
            "must_change_password": true
        }"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "A1");
        assert_eq!(token.refresh_token.as_deref(), Some("R1"));
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.user_id, Some(UserId::from("42")));
        assert!(token.must_change_password);
    }

    #[test]
    fn token_response_defaults_optional_fields() {
        let json = r#"{"access_token":"A2","expires_in":900}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.refresh_token.is_none());
        assert_eq!(token.token_type, "bearer");
        assert!(token.user_id.is_none());
        assert!(!token.must_change_password);
    }

    #[test]
    fn register_request_omits_missing_email() {
        let body = RegisterRequest {
            username: "alice",
            password: "pw",
            email: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["username"], "alice");
        assert!(json.get("email").is_none());
    }

    #[tokio::test]
    async fn refresh_against_unreachable_backend_is_http_error() {
        let client = reqwest::Client::new();
        let err = refresh_token(&client, "http://127.0.0.1:1", "R1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn login_against_unreachable_backend_is_http_error() {
        let client = reqwest::Client::new();
        let err = login(&client, "http://127.0.0.1:1", "alice", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got: {err:?}");
    }
}
