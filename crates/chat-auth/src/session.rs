//! Authenticated session: credential store + refresh gate + proactive timer
//!
//! One `AuthSession` is built at the application root and shared (it is a
//! cheap `Clone`) with every request dispatcher. All writes to the stored
//! token pair go through here: login/register, refresh, logout/clear.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::MIN_REFRESH_SECS;
use crate::credentials::{CredentialStore, Credentials, Swap, now_millis};
use crate::error::Result;
use crate::metrics::{RefreshOutcome, record_refresh};
use crate::refresher::{RefreshTrigger, SingleFlight};
use crate::timer::RefreshTimer;
use crate::token::{self, RegisterRequest, TokenResponse};

struct SessionInner {
    client: reqwest::Client,
    base_url: String,
    store: CredentialStore,
    flight: SingleFlight,
    timer: RefreshTimer,
}

/// Shared handle to the current authenticated session.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl AuthSession {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, store: CredentialStore) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                client,
                base_url: base_url.into(),
                store,
                flight: SingleFlight::new(),
                timer: RefreshTimer::new(),
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn timer(&self) -> &RefreshTimer {
        &self.inner.timer
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.inner.store.get().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credentials().await.is_some()
    }

    /// Re-arm the proactive timer for a session loaded from disk.
    ///
    /// Fires when the stored `expires_at` is reached, but no sooner than the
    /// minimum refresh delay. Returns whether a session was present.
    pub async fn restore(&self) -> bool {
        let restored = self
            .inner
            .store
            .with_current(|current| {
                let credentials = current?;
                let delay = credentials
                    .remaining(now_millis())
                    .max(Duration::from_secs(MIN_REFRESH_SECS));
                self.inner
                    .timer
                    .schedule_after(delay, proactive_callback(&self.inner));
                Some((credentials.user_id.clone(), delay))
            })
            .await;
        let Some((user_id, delay)) = restored else {
            return false;
        };
        info!(
            user_id = ?user_id,
            refresh_in_secs = delay.as_secs(),
            "restored persisted session"
        );
        true
    }

    /// Sign in and establish the session.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse> {
        let response = token::login(&self.inner.client, &self.inner.base_url, username, password)
            .await?;
        self.establish(&response).await?;
        info!(user_id = ?response.user_id, "logged in");
        Ok(response)
    }

    /// Create an account and establish the session.
    pub async fn register(&self, request: &RegisterRequest<'_>) -> Result<TokenResponse> {
        let response = token::register(&self.inner.client, &self.inner.base_url, request).await?;
        self.establish(&response).await?;
        info!(user_id = ?response.user_id, "registered");
        Ok(response)
    }

    /// Store a token pair obtained out of band and arm the proactive timer.
    pub async fn establish(&self, response: &TokenResponse) -> Result<Credentials> {
        let credentials = Credentials::from_token_response(response, now_millis())?;
        let arm = |_: &Credentials| {
            self.inner
                .timer
                .schedule(response.expires_in, proactive_callback(&self.inner));
        };
        if let Err(e) = self.inner.store.set_then(credentials.clone(), arm).await {
            warn!(error = %e, "failed to persist credentials, session kept in memory");
        }
        Ok(credentials)
    }

    /// Refresh the access token, sharing any refresh already in flight.
    ///
    /// A failure leaves the stored credentials untouched; deciding whether to
    /// tear the session down belongs to the caller.
    pub async fn refresh(&self) -> bool {
        self.run_refresh(RefreshTrigger::Manual).await
    }

    /// Reactive refresh after the server rejected `rejected_access`.
    ///
    /// If the stored access token already differs from the rejected one, a
    /// refresh (or new login) completed after that request was sent and the
    /// caller can retry straight away without another backend call.
    pub async fn refresh_rejected(&self, rejected_access: &str) -> bool {
        match self.credentials().await {
            None => false,
            Some(current) if current.access_token != rejected_access => {
                debug!("access token already replaced, retrying with current token");
                true
            }
            Some(_) => self.run_refresh(RefreshTrigger::Reactive).await,
        }
    }

    /// Invalidate the session server-side (best effort) and clear it locally.
    pub async fn logout(&self) {
        if let Some(credentials) = self.credentials().await
            && let Err(e) = token::logout(
                &self.inner.client,
                &self.inner.base_url,
                &credentials.access_token,
            )
            .await
        {
            warn!(error = %e, "server-side logout failed, clearing local session anyway");
        }
        self.clear().await;
        info!("logged out");
    }

    /// Drop the stored credentials and cancel the proactive timer.
    ///
    /// The timer is cancelled under the store lock, after the pair is gone, so
    /// a refresh finishing concurrently cannot leave it armed.
    pub async fn clear(&self) {
        let timer = &self.inner.timer;
        let cleared = self.inner.store.clear_then(|| {
            timer.cancel();
        });
        if let Err(e) = cleared.await {
            warn!(error = %e, "failed to remove persisted credentials");
        }
    }

    async fn run_refresh(&self, trigger: RefreshTrigger) -> bool {
        let inner = self.inner.clone();
        self.inner
            .flight
            .run(move || perform_refresh(inner, trigger))
            .await
    }
}

/// The refresh itself. Runs detached inside the single-flight gate.
async fn perform_refresh(inner: Arc<SessionInner>, trigger: RefreshTrigger) -> bool {
    let Some(current) = inner.store.get().await else {
        debug!(trigger = trigger.label(), "no session to refresh");
        record_refresh(trigger, RefreshOutcome::NoSession);
        return false;
    };

    let response =
        match token::refresh_token(&inner.client, &inner.base_url, &current.refresh_token).await {
            Ok(response) => response,
            Err(e) => {
                warn!(trigger = trigger.label(), error = %e, "token refresh failed");
                record_refresh(trigger, RefreshOutcome::Failure);
                return false;
            }
        };

    let rotated = current.rotated(&response, now_millis());
    // Re-armed only while the rotated pair is current; a concurrent clear
    // either sees this timer and cancels it or makes the swap fail.
    let arm = |_: &Credentials| {
        inner
            .timer
            .schedule(response.expires_in, proactive_callback(&inner));
    };
    match inner
        .store
        .replace_if_then(&current.refresh_token, rotated, arm)
        .await
    {
        Ok(Swap::Replaced) => {}
        Ok(Swap::Superseded) => {
            debug!("session replaced during refresh, keeping the newer credentials");
            record_refresh(trigger, RefreshOutcome::Success);
            return true;
        }
        Ok(Swap::Missing) => {
            info!("session cleared during refresh, discarding new tokens");
            record_refresh(trigger, RefreshOutcome::NoSession);
            return false;
        }
        Err(e) => {
            warn!(error = %e, "failed to persist refreshed credentials, session kept in memory");
        }
    }

    info!(
        trigger = trigger.label(),
        expires_in = response.expires_in,
        rotated_refresh_token = response.refresh_token.is_some(),
        "token refresh succeeded"
    );
    record_refresh(trigger, RefreshOutcome::Success);
    true
}

type BoxedRefresh = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Timer callback. Holds only a weak reference so a pending timer does not
/// keep a dropped session alive.
fn proactive_callback(inner: &Arc<SessionInner>) -> impl FnOnce() -> BoxedRefresh + Send + 'static {
    let weak = Arc::downgrade(inner);
    move || -> BoxedRefresh { Box::pin(proactive_refresh(weak)) }
}

async fn proactive_refresh(weak: Weak<SessionInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let session = AuthSession { inner };
    // Not fatal: the access token may still have time left, and the next
    // rejected request retries reactively.
    if !session.run_refresh(RefreshTrigger::Proactive).await {
        warn!("proactive refresh failed, next rejected request will retry");
    }
}
