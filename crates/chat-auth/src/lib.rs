//! Session authentication for the chat backend client
//!
//! Owns everything that touches the token pair: the credential store, the
//! auth endpoint calls, the single-flight refresh gate and the proactive
//! refresh timer. `AuthSession` ties them together and is what the request
//! dispatcher (`chat-api`) is handed.
//!
//! Session flow:
//! 1. `AuthSession::login()` / `register()` stores the pair and arms the timer
//! 2. The timer fires `max(expires_in - 60, 10)` seconds later and refreshes
//! 3. A 401 elsewhere calls `AuthSession::refresh_rejected()`, sharing any
//!    refresh already in flight
//! 4. Each successful refresh re-arms the timer from the new `expires_in`
//! 5. `logout()` / `clear()` drop the pair and cancel the timer

pub mod constants;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod refresher;
pub mod session;
pub mod timer;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialStore, Credentials, Swap, UserId};
pub use error::{Error, Result};
pub use refresher::{RefreshTrigger, SingleFlight};
pub use session::AuthSession;
pub use timer::{RefreshTimer, refresh_delay};
pub use token::{RegisterRequest, TokenResponse};

/// Lock a std mutex, recovering the data if a holder panicked. The guarded
/// state here is always left consistent between statements.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
