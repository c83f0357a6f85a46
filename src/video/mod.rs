//! Video acquisition: stream URL capture plus a quota-tolerant download.
//!
//! The storage API does not hand out streaming URLs for videos, so one is
//! observed from a pooled browser session viewing the resource. The stream
//! is then downloaded with the download role's bearer token. Quota or
//! permission failures during the download refresh the token, capture a
//! fresh URL and try again on a linear schedule (5 attempts, `n * 10s`).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rehoster_core::auth::AuthenticatedClient;
//! use rehoster_core::browser::SessionPool;
//! use rehoster_core::locator::resolve;
//! use rehoster_core::video::{BrowserStreamSource, VideoAcquirer, VideoSource};
//!
//! # async fn example(pool: SessionPool, client: AuthenticatedClient) -> Result<(), Box<dyn std::error::Error>> {
//! let urls = BrowserStreamSource::new(pool, "/home/me/.config/rehoster/profile");
//! let acquirer = VideoAcquirer::new(client, Arc::new(urls));
//! let video = resolve("https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUvWxYz/view")?;
//! acquirer.acquire(&video, Path::new("/tmp/lecture.mp4")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_LENGTH;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::auth::{AuthenticatedClient, CredentialError};
use crate::browser::{BrowserError, SessionPool};
use crate::locator::ResourceRef;
use crate::remote::{RemoteError, check_status, stream_to_file};
use crate::retry::{FailureType, RetryError, RetryPolicy, retry_with};

/// Hard limit on waiting for the stream request to appear.
pub const DEFAULT_STREAM_WAIT: Duration = Duration::from_secs(30);

/// Download attempts, the first included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay step; attempt `n` waits `n * step` after failing.
pub const DEFAULT_RETRY_STEP: Duration = Duration::from_secs(10);

/// Progress is logged every time this many more bytes have arrived.
const PROGRESS_LOG_BYTES: u64 = 16 * 1024 * 1024;

/// Outbound requests carrying the video stream.
#[allow(clippy::expect_used)]
static STREAM_URL_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("videoplayback").expect("stream url regex is valid"));

/// Video acquisition errors.
#[derive(Debug, Error)]
pub enum VideoError {
    /// No stream request was observed in time.
    #[error("no stream URL observed for {resource_id} within {waited:?}")]
    StreamUrlTimeout { resource_id: String, waited: Duration },

    /// Every download attempt failed.
    #[error("download of {resource_id} failed after {attempts} attempts: {last_cause}")]
    DownloadExhausted {
        resource_id: String,
        attempts: u32,
        last_cause: String,
    },

    /// Browser pool or session failure.
    #[error(transparent)]
    Browser(#[from] BrowserError),

    /// Remote failure while downloading.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Token could not be obtained or refreshed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl VideoError {
    /// Quota and permission failures are retried here: a session-bound
    /// stream URL goes stale and surfaces as 403.
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Remote(RemoteError::QuotaExceeded { .. } | RemoteError::PermissionDenied { .. }) => {
                FailureType::RateLimited
            }
            Self::Remote(other) => other.failure_type(),
            Self::StreamUrlTimeout { .. }
            | Self::DownloadExhausted { .. }
            | Self::Browser(_)
            | Self::Credentials(_) => FailureType::Permanent,
        }
    }
}

/// Produces a direct streaming URL for a video resource.
#[async_trait]
pub trait StreamUrlSource: Send + Sync {
    async fn stream_url(&self, resource: &ResourceRef) -> Result<String, VideoError>;
}

/// Downloads a video resource to a local file.
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Writes the video to `dest`, returning the byte count.
    async fn acquire(&self, resource: &ResourceRef, dest: &Path) -> Result<u64, VideoError>;
}

/// Captures stream URLs by watching a pooled browser load the viewer page.
#[derive(Debug, Clone)]
pub struct BrowserStreamSource {
    pool: SessionPool,
    profile: String,
    wait: Duration,
}

impl BrowserStreamSource {
    #[must_use]
    pub fn new(pool: SessionPool, profile: impl Into<String>) -> Self {
        Self {
            pool,
            profile: profile.into(),
            wait: DEFAULT_STREAM_WAIT,
        }
    }

    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// Viewer page that triggers the stream request.
#[must_use]
pub fn viewer_url(resource: &ResourceRef) -> String {
    match resource.resource_key() {
        Some(key) => format!(
            "https://drive.google.com/file/d/{}/view?resourcekey={}",
            resource.id(),
            urlencoding::encode(key)
        ),
        None => format!("https://drive.google.com/file/d/{}/view", resource.id()),
    }
}

/// Drops any `range` query parameter so the whole stream is fetched.
#[must_use]
pub fn strip_range_param(stream_url: &str) -> String {
    let Ok(mut parsed) = Url::parse(stream_url) else {
        return stream_url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "range")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}

#[async_trait]
impl StreamUrlSource for BrowserStreamSource {
    #[instrument(skip(self), fields(resource_id = %resource.id()))]
    async fn stream_url(&self, resource: &ResourceRef) -> Result<String, VideoError> {
        let lease = self.pool.acquire(&self.profile).await?;
        let captured = lease
            .session()
            .capture_request(&viewer_url(resource), &STREAM_URL_PATTERN, self.wait)
            .await;

        match captured {
            Ok(url) => {
                debug!("stream URL captured");
                Ok(strip_range_param(&url))
            }
            Err(BrowserError::Timeout { waited }) => Err(VideoError::StreamUrlTimeout {
                resource_id: resource.id().to_string(),
                waited,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Downloads video streams with refresh-and-recapture retries.
#[derive(Clone)]
pub struct VideoAcquirer {
    client: AuthenticatedClient,
    urls: Arc<dyn StreamUrlSource>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for VideoAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoAcquirer")
            .field("client", &self.client)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl VideoAcquirer {
    /// `client` should authorize as the download role.
    #[must_use]
    pub fn new(client: AuthenticatedClient, urls: Arc<dyn StreamUrlSource>) -> Self {
        Self {
            client,
            urls,
            policy: RetryPolicy::linear(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_STEP),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn attempt(
        &self,
        resource: &ResourceRef,
        dest: &Path,
        attempt: u32,
    ) -> Result<u64, VideoError> {
        if attempt > 1 {
            let stale = self.client.access_token().await?;
            self.client
                .manager()
                .refresh(self.client.role(), &stale)
                .await?;
        }

        let stream_url = self.urls.stream_url(resource).await?;
        let response = self
            .client
            .send(|http| http.get(&stream_url))
            .await
            .map_err(|e| RemoteError::from_client("download_video", e))?;
        let response = check_status(response, "download_video", resource.id()).await?;

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let mut next_log = PROGRESS_LOG_BYTES;
        let written = stream_to_file(response, dest, "download_video", |bytes| {
            if bytes >= next_log {
                debug!(bytes, total, "video download progress");
                next_log = bytes + PROGRESS_LOG_BYTES;
            }
        })
        .await?;
        Ok(written)
    }
}

#[async_trait]
impl VideoSource for VideoAcquirer {
    #[instrument(skip(self, dest), fields(resource_id = %resource.id()))]
    async fn acquire(&self, resource: &ResourceRef, dest: &Path) -> Result<u64, VideoError> {
        let result = retry_with(&self.policy, VideoError::failure_type, |attempt| {
            self.attempt(resource, dest, attempt)
        })
        .await;

        match result {
            Ok(bytes) => {
                info!(bytes, "video downloaded");
                Ok(bytes)
            }
            Err(RetryError::Permanent { error, .. }) => Err(error),
            Err(RetryError::Exhausted { last, attempts }) => {
                warn!(attempts, error = %last, "video download exhausted");
                Err(VideoError::DownloadExhausted {
                    resource_id: resource.id().to_string(),
                    attempts,
                    last_cause: last.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use regex::Regex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::{
        CredentialManager, CredentialRecord, MemoryCredentialStore, Role, TokenGrant,
        TokenRefresher,
    };
    use crate::browser::{BrowserSession, PoolConfig, SessionLauncher};
    use crate::locator::resolve;

    const VIDEO_ID: &str = "1VideoIdVideoIdVideoIdVideo";

    struct CountingRefresher(AtomicU32);

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _role: Role, _refresh: &str) -> Result<TokenGrant, CredentialError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                access_token: format!("token-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
            })
        }
    }

    struct FixedUrls {
        url: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StreamUrlSource for FixedUrls {
        async fn stream_url(&self, _resource: &ResourceRef) -> Result<String, VideoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.url.clone())
        }
    }

    fn client(refresher: Arc<CountingRefresher>) -> AuthenticatedClient {
        let store = Arc::new(MemoryCredentialStore::with_records([CredentialRecord::new(
            Role::Download,
            "token-0",
            "refresh",
            None,
        )]));
        let manager = Arc::new(CredentialManager::new(store, refresher));
        manager.get_client(Role::Download, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_forbidden_download_refreshes_and_recaptures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videoplayback"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/videoplayback"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video-bytes".to_vec()))
            .mount(&server)
            .await;

        let refresher = Arc::new(CountingRefresher(AtomicU32::new(0)));
        let urls = Arc::new(FixedUrls {
            url: format!("{}/videoplayback", server.uri()),
            calls: AtomicU32::new(0),
        });
        let acquirer = VideoAcquirer::new(client(refresher.clone()), urls.clone())
            .with_retry_policy(RetryPolicy::linear(5, Duration::from_millis(1)));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("video.mp4");

        let bytes = acquirer
            .acquire(&resolve(VIDEO_ID).unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"video-bytes");
        assert_eq!(refresher.0.load(Ordering::SeqCst), 2);
        assert_eq!(urls.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_quota_failure_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string(r#"{"error":{"errors":[{"reason":"downloadQuotaExceeded"}]}}"#),
            )
            .mount(&server)
            .await;

        let refresher = Arc::new(CountingRefresher(AtomicU32::new(0)));
        let urls = Arc::new(FixedUrls {
            url: format!("{}/videoplayback", server.uri()),
            calls: AtomicU32::new(0),
        });
        let acquirer = VideoAcquirer::new(client(refresher), urls.clone())
            .with_retry_policy(RetryPolicy::linear(5, Duration::from_millis(1)));
        let dir = tempfile::tempdir().unwrap();

        let err = acquirer
            .acquire(&resolve(VIDEO_ID).unwrap(), &dir.path().join("v.mp4"))
            .await
            .unwrap_err();

        match err {
            VideoError::DownloadExhausted { attempts, last_cause, .. } => {
                assert_eq!(attempts, 5);
                assert!(last_cause.contains("quota"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(urls.calls.load(Ordering::SeqCst), 5);
        assert!(!dir.path().join("v.mp4").exists());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let urls = Arc::new(FixedUrls {
            url: format!("{}/videoplayback", server.uri()),
            calls: AtomicU32::new(0),
        });
        let acquirer = VideoAcquirer::new(
            client(Arc::new(CountingRefresher(AtomicU32::new(0)))),
            urls.clone(),
        )
        .with_retry_policy(RetryPolicy::linear(5, Duration::from_millis(1)));
        let dir = tempfile::tempdir().unwrap();

        let err = acquirer
            .acquire(&resolve(VIDEO_ID).unwrap(), &dir.path().join("v.mp4"))
            .await
            .unwrap_err();

        assert!(matches!(err, VideoError::Remote(RemoteError::NotFound { .. })));
        assert_eq!(urls.calls.load(Ordering::SeqCst), 1);
    }

    struct ScriptedSession {
        captured: Option<String>,
    }

    #[async_trait]
    impl BrowserSession for ScriptedSession {
        async fn capture_request(
            &self,
            url: &str,
            pattern: &Regex,
            wait: Duration,
        ) -> Result<String, BrowserError> {
            assert!(url.contains(VIDEO_ID));
            match &self.captured {
                Some(found) if pattern.is_match(found) => Ok(found.clone()),
                _ => Err(BrowserError::Timeout { waited: wait }),
            }
        }

        async fn close(&self) {}
    }

    struct ScriptedLauncher(Option<String>);

    #[async_trait]
    impl SessionLauncher for ScriptedLauncher {
        async fn launch(&self, _profile: &str) -> Result<Arc<dyn BrowserSession>, BrowserError> {
            Ok(Arc::new(ScriptedSession {
                captured: self.0.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_browser_source_strips_range() {
        let pool = SessionPool::new(
            Arc::new(ScriptedLauncher(Some(
                "https://r1.example.com/videoplayback?id=abc&range=0-1000&itag=18".to_string(),
            ))),
            PoolConfig::default(),
        );
        let source = BrowserStreamSource::new(pool.clone(), "profile-a");

        let url = source.stream_url(&resolve(VIDEO_ID).unwrap()).await.unwrap();

        assert_eq!(url, "https://r1.example.com/videoplayback?id=abc&itag=18");
        assert_eq!(pool.ref_count("profile-a"), Some(0));
    }

    #[tokio::test]
    async fn test_browser_source_maps_timeout() {
        let pool = SessionPool::new(Arc::new(ScriptedLauncher(None)), PoolConfig::default());
        let source =
            BrowserStreamSource::new(pool, "profile-b").with_wait(Duration::from_millis(5));

        let err = source
            .stream_url(&resolve(VIDEO_ID).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, VideoError::StreamUrlTimeout { .. }));
    }

    #[test]
    fn test_strip_range_param_keeps_other_pairs() {
        assert_eq!(
            strip_range_param("https://h/videoplayback?range=0-10"),
            "https://h/videoplayback"
        );
        assert_eq!(strip_range_param("not a url"), "not a url");
    }

    #[test]
    fn test_viewer_url_carries_resource_key() {
        let resource = resolve(&format!(
            "https://drive.google.com/file/d/{VIDEO_ID}/view?resourcekey=0-key"
        ))
        .unwrap();
        assert!(viewer_url(&resource).ends_with("?resourcekey=0-key"));
    }
}
