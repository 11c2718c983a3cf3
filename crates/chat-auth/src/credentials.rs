//! Credential storage for the current session
//!
//! Holds at most one token pair. The pair lives in a single
//! `Option<Credentials>` behind a tokio Mutex, so readers see either the old
//! pair or the new one, never a mix. When backed by a file, every write is
//! persisted with temp-file + rename so a crash cannot leave a torn file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::{MIN_REFRESH_SECS, REFRESH_MARGIN_SECS};
use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Backend user identifier. The backend may send it as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawUserId", into = "String")]
pub struct UserId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawUserId {
    Number(i64),
    Text(String),
}

impl From<RawUserId> for UserId {
    fn from(raw: RawUserId) -> Self {
        match raw {
            RawUserId::Number(n) => Self(n.to_string()),
            RawUserId::Text(s) => Self(s),
        }
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The current session's token pair.
///
/// `expires_at` is a unix timestamp in milliseconds, computed when the pair
/// is stored as `now + max(expires_in - 60, 10)` seconds: the point at which
/// the access token should be treated as spent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub expires_at: u64,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    /// Build a fresh pair from a login/register response.
    pub fn from_token_response(response: &TokenResponse, now_millis: u64) -> Result<Self> {
        let refresh_token = response
            .refresh_token
            .clone()
            .ok_or(Error::MissingRefreshToken)?;
        Ok(Self {
            access_token: response.access_token.clone(),
            refresh_token,
            user_id: response.user_id.clone(),
            expires_at: expires_at_millis(response.expires_in, now_millis),
        })
    }

    /// Apply a refresh response. The refresh token is only replaced when the
    /// backend rotated it; the user id only when the backend sent one.
    pub fn rotated(&self, response: &TokenResponse, now_millis: u64) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response
                .refresh_token
                .clone()
                .unwrap_or_else(|| self.refresh_token.clone()),
            user_id: response.user_id.clone().or_else(|| self.user_id.clone()),
            expires_at: expires_at_millis(response.expires_in, now_millis),
        }
    }

    /// Time left until `expires_at` (zero once passed).
    pub fn remaining(&self, now_millis: u64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis))
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }
}

/// Absolute expiry for a token issued now with the given lifetime.
pub fn expires_at_millis(expires_in_secs: u64, now_millis: u64) -> u64 {
    let usable = expires_in_secs
        .saturating_sub(REFRESH_MARGIN_SECS)
        .max(MIN_REFRESH_SECS);
    now_millis + usable * 1000
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Outcome of [`CredentialStore::replace_if`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swap {
    /// The expected pair was current and has been replaced.
    Replaced,
    /// A different pair was stored in the meantime (e.g. a new login); left untouched.
    Superseded,
    /// The store is empty (logout or teardown happened); left untouched.
    Missing,
}

/// Single-session credential store, optionally persisted to a JSON file.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<Option<Credentials>>,
}

impl CredentialStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(None),
        }
    }

    /// Load a persisted session from `path`.
    ///
    /// A missing file means "no session"; it is created on the first `set`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: Credentials = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), user_id = ?credentials.user_id, "loaded persisted session");
            Some(credentials)
        } else {
            debug!(path = %path.display(), "no persisted session");
            None
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Snapshot of the current pair.
    pub async fn get(&self) -> Option<Credentials> {
        self.state.lock().await.clone()
    }

    /// Run `f` against the current pair while holding the store lock.
    ///
    /// Nothing can set, rotate or clear the pair until `f` returns.
    pub async fn with_current<R>(&self, f: impl FnOnce(Option<&Credentials>) -> R) -> R {
        let state = self.state.lock().await;
        f(state.as_ref())
    }

    /// Replace the stored pair.
    ///
    /// The in-memory pair is updated before persisting; if the file write
    /// fails the error is returned but the new pair stays in effect.
    pub async fn set(&self, credentials: Credentials) -> Result<()> {
        self.set_then(credentials, |_| {}).await
    }

    /// [`set`](Self::set), running `on_set` under the store lock once the
    /// new pair is in place.
    pub async fn set_then(
        &self,
        credentials: Credentials,
        on_set: impl FnOnce(&Credentials),
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        on_set(state.insert(credentials));
        debug!("stored credentials");
        self.persist(state.as_ref()).await
    }

    /// Replace the stored pair only if it still holds `expected_refresh`.
    ///
    /// `Err` is only returned for a persistence failure after a successful
    /// in-memory swap.
    pub async fn replace_if(&self, expected_refresh: &str, credentials: Credentials) -> Result<Swap> {
        self.replace_if_then(expected_refresh, credentials, |_| {})
            .await
    }

    /// [`replace_if`](Self::replace_if), running `on_replaced` under the store
    /// lock only when the swap happens.
    pub async fn replace_if_then(
        &self,
        expected_refresh: &str,
        credentials: Credentials,
        on_replaced: impl FnOnce(&Credentials),
    ) -> Result<Swap> {
        let mut state = self.state.lock().await;
        match state.as_ref() {
            None => return Ok(Swap::Missing),
            Some(current) if current.refresh_token != expected_refresh => {
                return Ok(Swap::Superseded);
            }
            Some(_) => {}
        }
        on_replaced(state.insert(credentials));
        debug!("rotated credentials");
        self.persist(state.as_ref()).await?;
        Ok(Swap::Replaced)
    }

    /// Remove the stored pair. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        self.clear_then(|| {}).await
    }

    /// [`clear`](Self::clear), running `on_cleared` under the store lock after
    /// the pair is gone.
    pub async fn clear_then(&self, on_cleared: impl FnOnce()) -> Result<()> {
        let mut state = self.state.lock().await;
        let had_session = state.take().is_some();
        on_cleared();
        if had_session {
            debug!("cleared credentials");
        }
        self.persist(None).await
    }

    async fn persist(&self, credentials: Option<&Credentials>) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        match credentials {
            Some(credentials) => write_atomic(path, credentials).await,
            None => remove_file(path).await,
        }
    }
}

/// Write credentials atomically: temp file in the same directory, 0600,
/// then rename over the target.
async fn write_atomic(path: &Path, credentials: &Credentials) -> Result<()> {
    let json = serde_json::to_string_pretty(credentials)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed credential file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(format!("removing credential file: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials(suffix: &str) -> Credentials {
        Credentials {
            access_token: format!("A{suffix}"),
            refresh_token: format!("R{suffix}"),
            user_id: Some(UserId::from("7")),
            expires_at: 1_735_500_000_000,
        }
    }

    fn token_response(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: refresh.map(Into::into),
            token_type: "bearer".into(),
            expires_in,
            user_id: None,
            must_change_password: false,
        }
    }

    #[test]
    fn expiry_subtracts_margin_with_floor() {
        let now = 1_000_000;
        assert_eq!(expires_at_millis(3600, now), now + 3_540_000);
        assert_eq!(expires_at_millis(70, now), now + 10_000);
        assert_eq!(expires_at_millis(30, now), now + 10_000);
        assert_eq!(expires_at_millis(0, now), now + 10_000);
    }

    #[test]
    fn from_token_response_requires_refresh_token() {
        let err = Credentials::from_token_response(&token_response("A1", None, 3600), 0)
            .unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken));
    }

    #[test]
    fn rotated_keeps_refresh_token_when_not_returned() {
        let current = test_credentials("1");
        let next = current.rotated(&token_response("A2", None, 3600), 0);
        assert_eq!(next.access_token, "A2");
        assert_eq!(next.refresh_token, "R1");
        assert_eq!(next.user_id, current.user_id);
        assert_eq!(next.expires_at, 3_540_000);
    }

    #[test]
    fn rotated_replaces_refresh_token_when_returned() {
        let next = test_credentials("1").rotated(&token_response("A2", Some("R2"), 3600), 0);
        assert_eq!(next.refresh_token, "R2");
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", test_credentials("secret"));
        assert!(!debug.contains("Asecret"), "got: {debug}");
        assert!(!debug.contains("Rsecret"), "got: {debug}");
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn user_id_accepts_number_or_string() {
        let n: UserId = serde_json::from_str("42").unwrap();
        let s: UserId = serde_json::from_str("\"u-42\"").unwrap();
        assert_eq!(n.to_string(), "42");
        assert_eq!(s.to_string(), "u-42");
        assert_eq!(serde_json::to_string(&n).unwrap(), "\"42\"");
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let creds = test_credentials("1");
        assert_eq!(creds.remaining(creds.expires_at + 5), Duration::ZERO);
        assert_eq!(
            creds.remaining(creds.expires_at - 1500),
            Duration::from_millis(1500)
        );
        assert!(creds.is_expired(creds.expires_at));
    }

    #[tokio::test]
    async fn in_memory_set_get_clear() {
        let store = CredentialStore::in_memory();
        assert!(store.get().await.is_none());

        store.set(test_credentials("1")).await.unwrap();
        assert_eq!(store.get().await.unwrap().access_token, "A1");

        store.clear().await.unwrap();
        assert!(store.get().await.is_none());
        // idempotent
        store.clear().await.unwrap();
        assert!(store.get().await.is_none());
    }

    #[tokio::test]
    async fn persisted_session_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        assert!(store.get().await.is_none());
        assert!(!path.exists());
        store.set(test_credentials("1")).await.unwrap();

        let reloaded = CredentialStore::load(path).await.unwrap();
        assert_eq!(reloaded.get().await, Some(test_credentials("1")));
    }

    #[tokio::test]
    async fn clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        store.set(test_credentials("1")).await.unwrap();
        assert!(path.exists());

        store.clear().await.unwrap();
        assert!(!path.exists());
        store.clear().await.unwrap();

        let reloaded = CredentialStore::load(path).await.unwrap();
        assert!(reloaded.get().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = CredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[tokio::test]
    async fn replace_if_swaps_only_matching_pair() {
        let store = CredentialStore::in_memory();
        assert_eq!(
            store.replace_if("R1", test_credentials("2")).await.unwrap(),
            Swap::Missing
        );
        assert!(store.get().await.is_none());

        store.set(test_credentials("1")).await.unwrap();
        assert_eq!(
            store.replace_if("R0", test_credentials("2")).await.unwrap(),
            Swap::Superseded
        );
        assert_eq!(store.get().await.unwrap().access_token, "A1");

        assert_eq!(
            store.replace_if("R1", test_credentials("2")).await.unwrap(),
            Swap::Replaced
        );
        assert_eq!(store.get().await.unwrap().access_token, "A2");
    }

    #[tokio::test]
    async fn hooks_run_only_when_the_pair_changes() {
        let store = CredentialStore::in_memory();
        let mut seen = Vec::new();

        let swap = store
            .replace_if_then("R1", test_credentials("2"), |c| seen.push(c.access_token.clone()))
            .await
            .unwrap();
        assert_eq!(swap, Swap::Missing);

        store
            .set_then(test_credentials("1"), |c| seen.push(c.access_token.clone()))
            .await
            .unwrap();
        let swap = store
            .replace_if_then("R0", test_credentials("3"), |c| seen.push(c.access_token.clone()))
            .await
            .unwrap();
        assert_eq!(swap, Swap::Superseded);
        let swap = store
            .replace_if_then("R1", test_credentials("2"), |c| seen.push(c.access_token.clone()))
            .await
            .unwrap();
        assert_eq!(swap, Swap::Replaced);
        assert_eq!(seen, ["A1", "A2"]);

        let mut cleared = false;
        store.clear_then(|| cleared = true).await.unwrap();
        assert!(cleared);
        assert!(store.with_current(|c| c.is_none()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        store.set(test_credentials("1")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_sets_leave_a_whole_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = std::sync::Arc::new(CredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(test_credentials(&i.to_string())).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let current = store.get().await.unwrap();
        let suffix = current.access_token.trim_start_matches('A');
        assert_eq!(current.refresh_token, format!("R{suffix}"));

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let on_disk: Credentials = serde_json::from_str(&contents).unwrap();
        assert_eq!(on_disk, current);
    }
}
