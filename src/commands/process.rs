//! Process and folder command handlers.
//!
//! Both wire the production collaborators (Drive clients per role, the
//! SQLite ledger, the Ghostscript engine and the Chromium pool) into a
//! [`Pipeline`], run it once, and print JSON on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use rehoster_core::auth::{CredentialManager, EncryptedFileStore, OAuthRefresher, Role};
use rehoster_core::browser::{ChromeLauncher, SessionPool};
use rehoster_core::ledger::SqliteLedger;
use rehoster_core::publish::Publisher;
use rehoster_core::raster::{GhostscriptRasterizer, RasterEngine};
use rehoster_core::remote::DriveClient;
use rehoster_core::retry::RetryPolicy;
use rehoster_core::video::{BrowserStreamSource, VideoAcquirer};
use rehoster_core::{
    Database, Pipeline, ProcessOptions, ProcessResponse, ProcessingReport, RuntimeSettings,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cli::Overrides;

/// JSON printed by `process`.
#[derive(Debug, Serialize)]
struct ProcessOutput<'a> {
    #[serde(flatten)]
    response: ProcessResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a ProcessingReport>,
}

/// A wired pipeline plus the browser pool it owns.
struct Runtime {
    pipeline: Pipeline,
    pool: SessionPool,
    reaper: JoinHandle<()>,
}

impl Runtime {
    async fn build(settings: &RuntimeSettings, overrides: &Overrides) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        let store = Arc::new(
            EncryptedFileStore::open(&settings.credentials_dir)
                .context("Failed to open credential storage")?,
        );
        let refresher = Arc::new(OAuthRefresher::new(
            http.clone(),
            settings.token_url.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        ));
        let manager = Arc::new(CredentialManager::new(store, refresher));

        let source = Arc::new(DriveClient::with_endpoints(
            manager.get_client(Role::Download, http.clone()),
            settings.api_base_url.clone(),
            settings.upload_base_url.clone(),
        ));
        let destination = Arc::new(DriveClient::with_endpoints(
            manager.get_client(Role::Upload, http.clone()),
            settings.api_base_url.clone(),
            settings.upload_base_url.clone(),
        ));
        let publisher = Publisher::new(
            destination,
            settings.root_folder_id.clone(),
            settings.default_folder_name.clone(),
        );

        let db = Database::new(&settings.database_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open ledger database '{}'",
                    settings.database_path.display()
                )
            })?;
        let ledger = Arc::new(SqliteLedger::new(db));

        let rasterizer = GhostscriptRasterizer::discover(settings.renderer_path.as_deref())
            .context("PDF rendering tool is not available")?;
        let cleaner = Arc::new(RasterEngine::new(
            Arc::new(rasterizer),
            settings.transform.clone(),
        ));

        let launcher = ChromeLauncher::new(settings.chrome_path.clone())
            .with_no_sandbox(overrides.no_sandbox);
        let pool = SessionPool::new(Arc::new(launcher), settings.pool_config());
        let reaper = pool.spawn_reaper();

        let profile = settings.browser_profile_dir.display().to_string();
        let urls =
            Arc::new(BrowserStreamSource::new(pool.clone(), profile).with_wait(settings.stream_wait));
        let video = Arc::new(
            VideoAcquirer::new(manager.get_client(Role::Download, http), urls).with_retry_policy(
                RetryPolicy::linear(settings.video_max_attempts, settings.video_retry_step),
            ),
        );

        tokio::fs::create_dir_all(&settings.work_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create work directory '{}'",
                    settings.work_dir.display()
                )
            })?;

        let pipeline = Pipeline::new(
            source,
            publisher,
            ledger,
            cleaner,
            video,
            settings.work_dir.clone(),
        )
        .with_folder_concurrency(settings.folder_concurrency)
        .with_max_folder_depth(settings.max_folder_depth);

        Ok(Self {
            pipeline,
            pool,
            reaper,
        })
    }

    async fn shutdown(self) {
        self.pool.shutdown().await;
        self.reaper.abort();
    }
}

pub async fn run_process(
    settings: &RuntimeSettings,
    overrides: &Overrides,
    url: &str,
    folder: bool,
    collection: Option<String>,
    show_spinner: bool,
) -> Result<()> {
    let runtime = Runtime::build(settings, overrides).await?;
    let options = ProcessOptions {
        is_folder: folder,
        collection,
    };

    let spinner = spinner(show_spinner, "Processing");
    let result = runtime.pipeline.process_resource(url, &options).await;
    spinner.finish_and_clear();
    runtime.shutdown().await;

    let output = ProcessOutput {
        response: ProcessResponse::from(&result),
        report: result.as_ref().ok().and_then(|o| o.report.as_ref()),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to encode result")?
    );

    match result {
        Ok(outcome) => {
            info!(
                resource_id = %outcome.resource_id,
                link = %outcome.processed_link,
                "Done"
            );
            Ok(())
        }
        Err(e) => bail!("Processing failed ({}): {e}", e.kind()),
    }
}

pub async fn run_folder(
    settings: &RuntimeSettings,
    overrides: &Overrides,
    url: &str,
    collection: Option<String>,
    show_spinner: bool,
) -> Result<()> {
    let runtime = Runtime::build(settings, overrides).await?;

    let spinner = spinner(show_spinner, "Walking folder");
    let result = runtime
        .pipeline
        .process_folder(url, collection.as_deref())
        .await;
    spinner.finish_and_clear();
    runtime.shutdown().await;

    let report = result.context("Folder processing failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to encode report")?
    );

    if report.failed() > 0 {
        warn!(
            failed = report.failed(),
            succeeded = report.succeeded(),
            "Some entries failed"
        );
    }
    Ok(())
}

fn spinner(visible: bool, message: &'static str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}
