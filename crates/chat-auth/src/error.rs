//! Error types for session and token operations

/// Errors from talking to the auth endpoints or managing stored credentials.
///
/// None of these cross the request dispatcher boundary: a failed refresh only
/// decides whether the original request is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint error: {0}")]
    TokenEndpoint(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token response carried no refresh_token")]
    MissingRefreshToken,

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
