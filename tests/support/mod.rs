//! Shared fixtures for pipeline integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rehoster_core::ledger::SqliteLedger;
use rehoster_core::locator::ResourceRef;
use rehoster_core::publish::Publisher;
use rehoster_core::raster::{Dewatermarker, RasterError};
use rehoster_core::remote::{MemoryStore, RemoteStore};
use rehoster_core::video::{VideoError, VideoSource};
use rehoster_core::{Database, Pipeline};
use tempfile::TempDir;

/// Prefix the fake cleaner puts in front of every output.
pub const CLEAN_MARKER: &[u8] = b"CLEAN:";

/// Content that makes [`CopyCleaner`] fail on the second page.
pub const CORRUPT: &[u8] = b"corrupt";

/// Cleaner that copies its input behind [`CLEAN_MARKER`].
#[derive(Debug, Default)]
pub struct CopyCleaner {
    pub pdf_calls: AtomicU32,
    pub image_calls: AtomicU32,
}

impl CopyCleaner {
    async fn copy(input: &Path, output: &Path) -> Result<(), RasterError> {
        let content = tokio::fs::read(input)
            .await
            .map_err(|e| RasterError::io(input, e))?;
        if content.windows(CORRUPT.len()).any(|w| w == CORRUPT) {
            return Err(RasterError::PageProcessingFailed {
                page_index: 1,
                cause: "unreadable page".to_string(),
            });
        }
        let mut cleaned = CLEAN_MARKER.to_vec();
        cleaned.extend_from_slice(&content);
        tokio::fs::write(output, cleaned)
            .await
            .map_err(|e| RasterError::io(output, e))
    }
}

#[async_trait]
impl Dewatermarker for CopyCleaner {
    async fn clean_pdf(&self, input: &Path, output: &Path) -> Result<(), RasterError> {
        self.pdf_calls.fetch_add(1, Ordering::SeqCst);
        Self::copy(input, output).await
    }

    async fn clean_image(&self, input: &Path, output: &Path) -> Result<(), RasterError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        Self::copy(input, output).await
    }
}

/// Video source that serves fixed bytes, optionally failing every call.
#[derive(Debug, Default)]
pub struct FakeVideo {
    pub calls: AtomicU32,
    pub exhausted: bool,
}

#[async_trait]
impl VideoSource for FakeVideo {
    async fn acquire(&self, resource: &ResourceRef, dest: &Path) -> Result<u64, VideoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.exhausted {
            return Err(VideoError::DownloadExhausted {
                resource_id: resource.id().to_string(),
                attempts: 5,
                last_cause: "HTTP 403".to_string(),
            });
        }
        let bytes = format!("video:{}", resource.id());
        tokio::fs::write(dest, &bytes).await.unwrap();
        Ok(bytes.len() as u64)
    }
}

/// A pipeline over one in-memory store holding both originals and outputs.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<SqliteLedger>,
    pub cleaner: Arc<CopyCleaner>,
    pub video: Arc<FakeVideo>,
    pub pipeline: Pipeline,
    _work_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_video(FakeVideo::default()).await
    }

    pub async fn with_video(video: FakeVideo) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_folder("root", "My Drive", "");
        store.insert_folder("src", "Shared", "");

        let ledger = Arc::new(SqliteLedger::new(Database::new_in_memory().await.unwrap()));
        let cleaner = Arc::new(CopyCleaner::default());
        let video = Arc::new(video);
        let work_dir = tempfile::tempdir().unwrap();

        let dyn_store = Arc::clone(&store) as Arc<dyn RemoteStore>;
        let publisher = Publisher::new(Arc::clone(&dyn_store), "root", "Processed");
        let pipeline = Pipeline::new(
            dyn_store,
            publisher,
            ledger.clone(),
            cleaner.clone(),
            video.clone(),
            work_dir.path(),
        )
        .with_folder_concurrency(3);

        Self {
            store,
            ledger,
            cleaner,
            video,
            pipeline,
            _work_dir: work_dir,
        }
    }

    /// Folder named `name` directly under the destination root.
    pub fn top_folder(&self, name: &str) -> Option<String> {
        self.child_named("root", name)
    }

    /// Id of file `name` inside top-level folder `folder`; panics if absent.
    pub fn folder_file(&self, folder: &str, name: &str) -> String {
        let folder = self.top_folder(folder).unwrap();
        self.child_named(&folder, name).unwrap()
    }

    pub fn child_named(&self, parent: &str, name: &str) -> Option<String> {
        self.store
            .children(parent)
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.resource_id)
    }
}

/// Share link for a file id.
pub fn file_link(id: &str) -> String {
    format!("https://drive.google.com/file/d/{id}/view?usp=sharing")
}

/// Share link for a folder id.
pub fn folder_link(id: &str) -> String {
    format!("https://drive.google.com/drive/folders/{id}")
}
