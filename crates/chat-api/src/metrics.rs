//! Request counters
//!
//! - `chat_api_requests_total` (counter): label `outcome`
//! - `chat_api_auth_retries_total` (counter): requests resent after a refresh

use crate::error::ApiError;

pub fn record_outcome<T>(result: &Result<T, ApiError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    metrics::counter!("chat_api_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_auth_retry() {
    metrics::counter!("chat_api_auth_retries_total").increment(1);
}
