//! Chromium sessions driven over the DevTools protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventRequestWillBeSent};
use futures_util::StreamExt;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{BrowserError, BrowserSession, SessionLauncher};

const CHROME_ARGS: [&str; 6] = [
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--mute-audio",
    "--autoplay-policy=no-user-gesture-required",
    "--disable-background-networking",
];

/// Launches headless Chromium with a persistent profile directory.
#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    executable: Option<PathBuf>,
    no_sandbox: bool,
}

impl ChromeLauncher {
    /// `executable` overrides Chromium discovery.
    #[must_use]
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self {
            executable,
            no_sandbox: false,
        }
    }

    /// Passes `--no-sandbox`, needed when running as root in containers.
    #[must_use]
    pub fn with_no_sandbox(mut self, no_sandbox: bool) -> Self {
        self.no_sandbox = no_sandbox;
        self
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    #[instrument(skip(self))]
    async fn launch(&self, profile: &str) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let launch_error = |reason: String| BrowserError::Launch {
            profile: profile.to_string(),
            reason,
        };

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile)
            .args(CHROME_ARGS);
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder.build().map_err(launch_error)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| launch_error(e.to_string()))?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Arc::new(ChromeSession {
            browser: Mutex::new(Some(browser)),
            handler_task,
        }))
    }
}

struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    handler_task: JoinHandle<()>,
}

impl ChromeSession {
    async fn open_page(&self) -> Result<Page, BrowserError> {
        let browser = self.browser.lock().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| BrowserError::session("browser already closed"))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(BrowserError::session)
    }
}

async fn watch_requests(page: &Page, url: &str, pattern: &Regex) -> Result<String, BrowserError> {
    page.execute(EnableParams::default())
        .await
        .map_err(BrowserError::session)?;
    let mut requests = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(BrowserError::session)?;

    let navigate = page.goto(url);
    tokio::pin!(navigate);
    let mut navigated = false;

    loop {
        tokio::select! {
            result = &mut navigate, if !navigated => {
                navigated = true;
                if let Err(e) = result {
                    warn!(error = %e, "viewer navigation reported an error, still watching requests");
                }
            }
            event = requests.next() => {
                let Some(event) = event else {
                    return Err(BrowserError::session("request event stream ended"));
                };
                if pattern.is_match(&event.request.url) {
                    return Ok(event.request.url.clone());
                }
            }
        }
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    #[instrument(skip(self, pattern))]
    async fn capture_request(
        &self,
        url: &str,
        pattern: &Regex,
        wait: Duration,
    ) -> Result<String, BrowserError> {
        let page = self.open_page().await?;
        let outcome = tokio::time::timeout(wait, watch_requests(&page, url, pattern)).await;

        if let Err(e) = page.close().await {
            debug!(error = %e, "failed to close tab");
        }

        match outcome {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout { waited: wait }),
        }
    }

    async fn close(&self) {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "browser close failed");
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
    }
}
