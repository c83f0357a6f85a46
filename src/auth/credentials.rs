//! Per-role credential records and the manager that refreshes them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::refresh::TokenRefresher;
use super::storage::{CredentialStore, StorageError};

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Which account a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Account that owns published artifacts.
    Upload,
    /// Account used to read source resources.
    Download,
}

impl Role {
    /// Both roles, upload first.
    pub const ALL: [Role; 2] = [Role::Upload, Role::Download];

    /// Lowercase name used in file names and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(format!("unknown role '{other}' (expected upload or download)")),
        }
    }
}

/// OAuth-style tokens for one role.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    role: Role,
    access_token: String,
    refresh_token: String,
    /// Unix seconds; `None` when the provider did not say.
    expiry: Option<i64>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("role", &self.role)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl CredentialRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        role: Role,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expiry: Option<i64>,
    ) -> Self {
        Self {
            role,
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub fn expiry(&self) -> Option<i64> {
        self.expiry
    }

    /// True when the access token expires within [`REFRESH_MARGIN_SECS`] of `now`.
    #[must_use]
    pub fn expires_soon(&self, now: i64) -> bool {
        self.expiry
            .is_some_and(|expiry| expiry - now <= REFRESH_MARGIN_SECS)
    }
}

/// Credential failures. Both are fatal for the calling job.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No stored record for the requested role.
    #[error("no stored credentials for the {role} account (run `rehoster auth set --role {role}`)")]
    Unavailable {
        /// Role that was requested
        role: Role,
    },

    /// The token endpoint rejected or failed the refresh.
    #[error("refreshing {role} credentials failed: {reason}")]
    RefreshFailed {
        /// Role being refreshed
        role: Role,
        /// What went wrong
        reason: String,
    },

    /// Loading or persisting the record failed.
    #[error("credential storage error: {0}")]
    Storage(#[from] StorageError),
}

impl CredentialError {
    /// Creates a [`CredentialError::RefreshFailed`].
    #[must_use]
    pub fn refresh_failed(role: Role, reason: impl Into<String>) -> Self {
        Self::RefreshFailed {
            role,
            reason: reason.into(),
        }
    }
}

type Slot = Arc<Mutex<Option<CredentialRecord>>>;

/// Holds one live record per role and refreshes it on demand.
///
/// Refreshes for a role are serialized by that role's slot lock; the
/// refreshed record is saved before the lock is released, so no caller ever
/// sees a token that is not yet persisted.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    slots: DashMap<Role, Slot>,
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

impl CredentialManager {
    /// Creates a manager; records are loaded lazily on first use.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            slots: DashMap::new(),
        }
    }

    /// Returns a client that authorizes requests as `role`.
    #[must_use]
    pub fn get_client(self: &Arc<Self>, role: Role, http: reqwest::Client) -> AuthenticatedClient {
        AuthenticatedClient {
            http,
            manager: Arc::clone(self),
            role,
        }
    }

    fn slot(&self, role: Role) -> Slot {
        Arc::clone(self.slots.entry(role).or_default().value())
    }

    async fn ensure_loaded(
        &self,
        role: Role,
        guard: &mut Option<CredentialRecord>,
    ) -> Result<(), CredentialError> {
        if guard.is_none() {
            *guard = self.store.load(role).await?;
        }
        if guard.is_none() {
            return Err(CredentialError::Unavailable { role });
        }
        Ok(())
    }

    /// Returns a usable access token, refreshing first if it is about to expire.
    ///
    /// # Errors
    ///
    /// [`CredentialError::Unavailable`] when nothing is stored for `role`,
    /// [`CredentialError::RefreshFailed`] when a due refresh fails.
    #[instrument(skip(self), fields(role = %role))]
    pub async fn access_token(&self, role: Role) -> Result<String, CredentialError> {
        let slot = self.slot(role);
        let mut guard = slot.lock().await;
        self.ensure_loaded(role, &mut guard).await?;

        if guard.as_ref().is_some_and(|r| r.expires_soon(unix_now())) {
            debug!("token expiring soon, refreshing proactively");
            self.refresh_locked(role, &mut guard).await?;
        }

        guard
            .as_ref()
            .map(|r| r.access_token.clone())
            .ok_or(CredentialError::Unavailable { role })
    }

    /// Refreshes `role` unless someone already replaced `stale_token`.
    ///
    /// Concurrent callers that all saw the same stale token trigger a
    /// single exchange; the rest receive the token it produced.
    ///
    /// # Errors
    ///
    /// Same as [`Self::access_token`], plus storage failures while persisting.
    #[instrument(skip(self, stale_token), fields(role = %role))]
    pub async fn refresh(&self, role: Role, stale_token: &str) -> Result<String, CredentialError> {
        let slot = self.slot(role);
        let mut guard = slot.lock().await;
        self.ensure_loaded(role, &mut guard).await?;

        let already_rotated = guard
            .as_ref()
            .is_some_and(|r| r.access_token != stale_token);
        if already_rotated {
            debug!("token already refreshed by another caller");
        } else {
            self.refresh_locked(role, &mut guard).await?;
        }

        guard
            .as_ref()
            .map(|r| r.access_token.clone())
            .ok_or(CredentialError::Unavailable { role })
    }

    async fn refresh_locked(
        &self,
        role: Role,
        guard: &mut Option<CredentialRecord>,
    ) -> Result<(), CredentialError> {
        let Some(current) = guard.as_ref() else {
            return Err(CredentialError::Unavailable { role });
        };

        let grant = self.refresher.refresh(role, &current.refresh_token).await?;
        let updated = CredentialRecord {
            role,
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expiry: grant.expires_in.map(|secs| unix_now() + secs),
        };

        self.store.save(&updated).await?;
        info!("credentials refreshed and persisted");
        *guard = Some(updated);
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Failure sending a request through an [`AuthenticatedClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not obtain or refresh a token.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// HTTP client that attaches a role's bearer token and retries once after
/// refreshing when the server answers 401.
#[derive(Clone)]
pub struct AuthenticatedClient {
    http: reqwest::Client,
    manager: Arc<CredentialManager>,
    role: Role,
}

impl std::fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl AuthenticatedClient {
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Unauthenticated client, for requests that carry their own authority
    /// (e.g. resumable upload session URLs).
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<CredentialManager> {
        &self.manager
    }

    /// Current access token for this client's role.
    ///
    /// # Errors
    ///
    /// See [`CredentialManager::access_token`].
    pub async fn access_token(&self) -> Result<String, CredentialError> {
        self.manager.access_token(self.role).await
    }

    /// Sends the request built by `build`, with bearer auth.
    ///
    /// `build` may run twice: once with the current token and, after a 401,
    /// once more with the refreshed one. Whatever the second response is,
    /// it is returned as-is.
    ///
    /// # Errors
    ///
    /// [`ClientError::Credentials`] if no token can be obtained,
    /// [`ClientError::Network`] on transport failure.
    pub async fn send<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let token = self.manager.access_token(self.role).await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(role = %self.role, "request unauthorized, refreshing token and retrying once");
        let fresh = self.manager.refresh(self.role, &token).await?;
        Ok(build(&self.http).bearer_auth(&fresh).send().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::super::refresh::TokenGrant;
    use super::super::storage::MemoryCredentialStore;
    use super::*;

    struct CountingRefresher {
        calls: AtomicU32,
        rotate_refresh: bool,
    }

    impl CountingRefresher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                rotate_refresh: false,
            }
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _role: Role, _refresh: &str) -> Result<TokenGrant, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(TokenGrant {
                access_token: format!("token-{n}"),
                refresh_token: self.rotate_refresh.then(|| format!("refresh-{n}")),
                expires_in: Some(3600),
            })
        }
    }

    struct FailingRefresher;

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self, role: Role, _refresh: &str) -> Result<TokenGrant, CredentialError> {
            Err(CredentialError::refresh_failed(role, "revoked"))
        }
    }

    fn manager_with(
        records: Vec<CredentialRecord>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (Arc<CredentialManager>, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::with_records(records));
        let manager = Arc::new(CredentialManager::new(
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            refresher,
        ));
        (manager, store)
    }

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("Upload".parse::<Role>().unwrap(), Role::Upload);
        assert_eq!(Role::Download.to_string(), "download");
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_record_debug_redacts_tokens() {
        let record = CredentialRecord::new(Role::Upload, "secret-a", "secret-r", None);
        let debug = format!("{record:?}");
        assert!(!debug.contains("secret-a"));
        assert!(!debug.contains("secret-r"));
    }

    #[test]
    fn test_expires_soon_uses_margin() {
        let record = CredentialRecord::new(Role::Upload, "a", "r", Some(1_000));
        assert!(record.expires_soon(950));
        assert!(!record.expires_soon(900));
        assert!(!CredentialRecord::new(Role::Upload, "a", "r", None).expires_soon(i64::MAX));
    }

    #[tokio::test]
    async fn test_access_token_without_record_is_unavailable() {
        let (manager, _) = manager_with(vec![], Arc::new(CountingRefresher::new()));
        let err = manager.access_token(Role::Download).await.unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable { role: Role::Download }));
    }

    #[tokio::test]
    async fn test_access_token_refreshes_when_expiring() {
        let refresher = Arc::new(CountingRefresher::new());
        let record = CredentialRecord::new(Role::Upload, "old", "r", Some(unix_now() + 5));
        let (manager, store) = manager_with(vec![record], refresher.clone());

        let token = manager.access_token(Role::Upload).await.unwrap();

        assert_eq!(token, "token-1");
        let persisted = store.load(Role::Upload).await.unwrap().unwrap();
        assert_eq!(persisted.access_token(), "token-1");
        assert_eq!(persisted.refresh_token(), "r");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_are_serialized() {
        let refresher = Arc::new(CountingRefresher::new());
        let record = CredentialRecord::new(Role::Upload, "stale", "r", None);
        let (manager, _) = manager_with(vec![record], refresher.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.refresh(Role::Upload, "stale").await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_persists_rotated_refresh_token() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            rotate_refresh: true,
        });
        let record = CredentialRecord::new(Role::Download, "a", "r0", None);
        let (manager, store) = manager_with(vec![record], refresher);

        manager.refresh(Role::Download, "a").await.unwrap();

        let persisted = store.load(Role::Download).await.unwrap().unwrap();
        assert_eq!(persisted.refresh_token(), "refresh-1");
        assert!(persisted.expiry().is_some());
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_record_untouched() {
        let record = CredentialRecord::new(Role::Upload, "a", "r", None);
        let (manager, store) = manager_with(vec![record], Arc::new(FailingRefresher));

        let err = manager.refresh(Role::Upload, "a").await.unwrap_err();

        assert!(matches!(err, CredentialError::RefreshFailed { .. }));
        assert_eq!(
            store.load(Role::Upload).await.unwrap().unwrap().access_token(),
            "a"
        );
    }

    #[tokio::test]
    async fn test_client_retries_once_after_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(header("authorization", "Bearer expired"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let record = CredentialRecord::new(Role::Download, "expired", "r", None);
        let (manager, store) = manager_with(vec![record], Arc::new(CountingRefresher::new()));
        let client = manager.get_client(Role::Download, reqwest::Client::new());

        let url = format!("{}/files", server.uri());
        let response = client.send(|http| http.get(&url)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.load(Role::Download).await.unwrap().unwrap().access_token(),
            "token-1"
        );
    }

    #[tokio::test]
    async fn test_client_returns_second_unauthorized_as_is() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let record = CredentialRecord::new(Role::Upload, "a", "r", None);
        let (manager, _) = manager_with(vec![record], Arc::new(CountingRefresher::new()));
        let client = manager.get_client(Role::Upload, reqwest::Client::new());

        let response = client.send(|http| http.get(server.uri())).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
