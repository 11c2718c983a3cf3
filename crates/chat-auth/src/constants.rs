//! Backend auth endpoints and refresh timing constants

/// Exchange username/password for a token pair
pub const LOGIN_PATH: &str = "/auth/login";

/// Create an account and receive a token pair
pub const REGISTER_PATH: &str = "/auth/register";

/// Exchange the refresh token (sent as Bearer) for a new access token
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Invalidate the current session server-side
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Current user profile
pub const ME_PATH: &str = "/auth/me";

/// Refresh this many seconds before the access token actually expires, to
/// absorb clock skew and in-flight latency.
pub const REFRESH_MARGIN_SECS: u64 = 60;

/// Lower bound on the proactive refresh delay. Very short-lived tokens would
/// otherwise cause back-to-back refreshes.
pub const MIN_REFRESH_SECS: u64 = 10;

/// Join a backend base URL and an absolute endpoint path.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
