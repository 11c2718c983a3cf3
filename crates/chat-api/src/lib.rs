//! Authenticated request dispatch for the chat backend
//!
//! `ApiClient` is the single entry point domain code uses to talk to the
//! backend. It attaches the session's bearer token, answers a 401 with one
//! shared refresh and one resend, and reports every outcome as an
//! [`ApiError`] variant instead of a raw status code.

pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod request;

pub use dispatcher::{ApiClient, UserProfile};
pub use error::{ApiError, Result};
pub use request::{Body, RequestContext, RequestOptions, RetryPolicy};
