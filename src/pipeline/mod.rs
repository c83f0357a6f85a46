//! Orchestration: locate, guard, clean or rehost, publish, record.
//!
//! [`Pipeline::process_resource`] handles one link end to end and returns a
//! typed result. [`Pipeline::process_folder`] walks a folder tree and never
//! fails because of a single child; per-child outcomes are collected in a
//! [`ProcessingReport`].
//!
//! # Example
//!
//! ```no_run
//! use rehoster_core::pipeline::{Pipeline, ProcessOptions};
//!
//! # async fn example(pipeline: Pipeline) -> Result<(), Box<dyn std::error::Error>> {
//! let outcome = pipeline
//!     .process_resource(
//!         "https://drive.google.com/file/d/1AbCdEfGhIjKlMnOpQrStUvWxYz/view",
//!         &ProcessOptions::default(),
//!     )
//!     .await?;
//! println!("{}", outcome.processed_link);
//! # Ok(())
//! # }
//! ```

mod folder;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

pub use folder::{EntryOutcome, ProcessingReport, ReportEntry};

use crate::error::PipelineError;
use crate::guard::{Decision, check_and_decide};
use crate::ledger::{Ledger, NewArtifactRecord};
use crate::locator::{ResourceKind, ResourceRef, resolve, resolve_folder};
use crate::publish::Publisher;
use crate::raster::Dewatermarker;
use crate::remote::{PDF_MIME, RemoteMetadata, RemoteStore, WORKSPACE_MIME_PREFIX};
use crate::video::VideoSource;

/// Workspace-native types that export to PDF.
const EXPORTABLE_WORKSPACE_TYPES: [&str; 4] = ["document", "spreadsheet", "presentation", "drawing"];

/// What kind of processing a resource gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Pdf,
    Image,
    /// Workspace document exported to PDF, then cleaned.
    Workspace,
    Video,
    Folder,
    /// Rehosted unchanged by a single call; skipped in folder walks.
    Other,
}

/// Classifies by MIME type.
#[must_use]
pub fn classify(mime_type: &str) -> ResourceClass {
    let mime = mime_type.trim().to_ascii_lowercase();
    if mime == crate::remote::FOLDER_MIME {
        return ResourceClass::Folder;
    }
    if mime == PDF_MIME {
        return ResourceClass::Pdf;
    }
    if matches!(mime.as_str(), "image/png" | "image/jpeg" | "image/jpg") {
        return ResourceClass::Image;
    }
    if mime.starts_with("video/") {
        return ResourceClass::Video;
    }
    if let Some(kind) = mime.strip_prefix(WORKSPACE_MIME_PREFIX)
        && EXPORTABLE_WORKSPACE_TYPES.contains(&kind)
    {
        return ResourceClass::Workspace;
    }
    ResourceClass::Other
}

/// Options for [`Pipeline::process_resource`].
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Treat the input as a folder and walk it.
    pub is_folder: bool,
    /// Destination collection folder; `None` uses the default folder.
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// A new artifact was published.
    Processed,
    /// A live artifact already existed.
    Skipped,
}

/// Successful result of [`Pipeline::process_resource`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub resource_id: String,
    pub processed_id: String,
    pub processed_link: String,
    /// Child outcomes when a folder was walked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ProcessingReport>,
}

/// Wire shape handed to callers: always a link or a failure reason.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Result<ProcessOutcome, PipelineError>> for ProcessResponse {
    fn from(result: &Result<ProcessOutcome, PipelineError>) -> Self {
        match result {
            Ok(outcome) => Self {
                status: match outcome.status {
                    ProcessStatus::Processed => "success",
                    ProcessStatus::Skipped => "skipped",
                },
                processed_link: Some(outcome.processed_link.clone()),
                error_kind: None,
                error: None,
            },
            Err(e) => Self {
                status: "error",
                processed_link: None,
                error_kind: Some(e.kind()),
                error: Some(e.to_string()),
            },
        }
    }
}

/// The processing pipeline and its collaborators.
#[derive(Clone)]
pub struct Pipeline {
    source: Arc<dyn RemoteStore>,
    publisher: Publisher,
    ledger: Arc<dyn Ledger>,
    cleaner: Arc<dyn Dewatermarker>,
    video: Arc<dyn VideoSource>,
    work_dir: PathBuf,
    folder_concurrency: usize,
    max_folder_depth: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("publisher", &self.publisher)
            .field("work_dir", &self.work_dir)
            .field("folder_concurrency", &self.folder_concurrency)
            .field("max_folder_depth", &self.max_folder_depth)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// `source` reads originals (download role); the publisher's store
    /// receives artifacts (upload role) and is where the guard looks.
    #[must_use]
    pub fn new(
        source: Arc<dyn RemoteStore>,
        publisher: Publisher,
        ledger: Arc<dyn Ledger>,
        cleaner: Arc<dyn Dewatermarker>,
        video: Arc<dyn VideoSource>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            publisher,
            ledger,
            cleaner,
            video,
            work_dir: work_dir.into(),
            folder_concurrency: crate::config::DEFAULT_FOLDER_CONCURRENCY,
            max_folder_depth: crate::config::DEFAULT_MAX_FOLDER_DEPTH,
        }
    }

    /// Siblings processed at once during a folder walk (minimum one).
    #[must_use]
    pub fn with_folder_concurrency(mut self, concurrency: usize) -> Self {
        self.folder_concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_max_folder_depth(mut self, depth: usize) -> Self {
        self.max_folder_depth = depth;
        self
    }

    /// Processes one link: a file, or a whole folder when
    /// `options.is_folder` is set or the link is a folder link.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`]. For folders, only failures of the folder
    /// itself are errors; child failures are in the returned report.
    #[instrument(skip(self, input), fields(input_len = input.len(), folder = options.is_folder))]
    pub async fn process_resource(
        &self,
        input: &str,
        options: &ProcessOptions,
    ) -> Result<ProcessOutcome, PipelineError> {
        let resource = if options.is_folder {
            resolve_folder(input)?
        } else {
            resolve(input)?
        };
        let collection = options.collection.as_deref();

        if resource.kind() == ResourceKind::Folder {
            return self.process_folder_resource(&resource, collection).await;
        }

        let metadata = self
            .source
            .get_metadata(resource.id(), resource.resource_key())
            .await?;
        if metadata.is_folder() {
            let folder = ResourceRef::from_listing(
                resource.id(),
                resource.resource_key().map(str::to_string),
                ResourceKind::Folder,
            );
            return self.process_folder_resource(&folder, collection).await;
        }
        self.process_file(&resource, Some(metadata), collection, &[]).await
    }

    /// Walks a folder link and returns the per-child report.
    ///
    /// # Errors
    ///
    /// Resolution failures and failures reading the folder itself.
    pub async fn process_folder(
        &self,
        input: &str,
        collection: Option<&str>,
    ) -> Result<ProcessingReport, PipelineError> {
        let folder = resolve_folder(input)?;
        let (report, _) = self.walk_root(&folder, collection).await?;
        Ok(report)
    }

    /// Walks a folder and records it in the ledger.
    ///
    /// A live folder record does not short-circuit the walk: children added
    /// upstream since the last run still need processing, and each child is
    /// guarded on its own. The record is still checked first so one whose
    /// destination folder vanished is dropped even if the walk then fails.
    async fn process_folder_resource(
        &self,
        folder: &ResourceRef,
        collection: Option<&str>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let dest_store = self.publisher.store();
        match check_and_decide(folder, self.ledger.as_ref(), dest_store.as_ref()).await? {
            Decision::Skip { record, .. } => {
                debug!(processed_id = %record.processed_id, "destination folder live, rewalking for new children");
            }
            Decision::Reprocess => debug!("destination folder gone, rebuilding"),
            Decision::New => debug!("folder not processed before"),
        }

        let (report, destination) = self.walk_root(folder, collection).await?;
        let link = dest_store.view_link(&destination.resource_id, true);

        self.ledger
            .upsert(&NewArtifactRecord {
                original_id: folder.id(),
                original_key: folder.resource_key(),
                processed_id: &destination.resource_id,
                processed_key: destination.resource_key.as_deref(),
                processed_link: &link,
                is_folder: true,
            })
            .await?;

        Ok(ProcessOutcome {
            status: ProcessStatus::Processed,
            resource_id: folder.id().to_string(),
            processed_id: destination.resource_id,
            processed_link: link,
            report: Some(report),
        })
    }

    /// Guard, acquire, clean, publish and record one file.
    ///
    /// `metadata` is reused when the caller already has it from a listing.
    #[instrument(skip(self, metadata, sub_path), fields(resource_id = %resource.id()))]
    pub(crate) async fn process_file(
        &self,
        resource: &ResourceRef,
        metadata: Option<RemoteMetadata>,
        collection: Option<&str>,
        sub_path: &[String],
    ) -> Result<ProcessOutcome, PipelineError> {
        let dest_store = self.publisher.store();
        match check_and_decide(resource, self.ledger.as_ref(), dest_store.as_ref()).await? {
            Decision::Skip {
                existing_link,
                record,
            } => {
                info!(link = %existing_link, "live artifact exists, skipping");
                return Ok(ProcessOutcome {
                    status: ProcessStatus::Skipped,
                    resource_id: resource.id().to_string(),
                    processed_id: record.processed_id,
                    processed_link: existing_link,
                    report: None,
                });
            }
            Decision::Reprocess => debug!("previous artifact gone, reprocessing"),
            Decision::New => debug!("not processed before"),
        }

        let metadata = match metadata {
            Some(m) => m,
            None => {
                self.source
                    .get_metadata(resource.id(), resource.resource_key())
                    .await?
            }
        };

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| PipelineError::io(&self.work_dir, e))?;
        let job_dir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| PipelineError::io(&self.work_dir, e))?;

        let artifact = self.produce_artifact(resource, &metadata, job_dir.path()).await?;
        let published = self
            .publisher
            .publish(
                &artifact.path,
                &artifact.display_name,
                &artifact.mime_type,
                collection,
                sub_path,
            )
            .await?;

        self.ledger
            .upsert(&NewArtifactRecord {
                original_id: resource.id(),
                original_key: resource.resource_key(),
                processed_id: &published.resource_id,
                processed_key: None,
                processed_link: &published.link,
                is_folder: false,
            })
            .await?;

        info!(link = %published.link, "resource processed");
        Ok(ProcessOutcome {
            status: ProcessStatus::Processed,
            resource_id: resource.id().to_string(),
            processed_id: published.resource_id,
            processed_link: published.link,
            report: None,
        })
    }

    async fn produce_artifact(
        &self,
        resource: &ResourceRef,
        metadata: &RemoteMetadata,
        job_dir: &Path,
    ) -> Result<Artifact, PipelineError> {
        let id = resource.id();
        let key = resource.resource_key();
        let class = classify(&metadata.mime_type);
        debug!(?class, mime_type = %metadata.mime_type, "classified");

        match class {
            ResourceClass::Pdf => {
                let original = job_dir.join("original.pdf");
                let cleaned = job_dir.join("cleaned.pdf");
                self.source.download_to(id, key, &original).await?;
                self.cleaner.clean_pdf(&original, &cleaned).await?;
                Ok(Artifact::new(cleaned, &metadata.name, PDF_MIME))
            }
            ResourceClass::Workspace => {
                let exported = job_dir.join("exported.pdf");
                let cleaned = job_dir.join("cleaned.pdf");
                self.source.export_as(id, key, PDF_MIME, &exported).await?;
                self.cleaner.clean_pdf(&exported, &cleaned).await?;
                Ok(Artifact::new(cleaned, &pdf_name(&metadata.name), PDF_MIME))
            }
            ResourceClass::Image => {
                let extension = if metadata.mime_type.ends_with("png") { "png" } else { "jpg" };
                let original = job_dir.join(format!("original.{extension}"));
                let cleaned = job_dir.join(format!("cleaned.{extension}"));
                self.source.download_to(id, key, &original).await?;
                self.cleaner.clean_image(&original, &cleaned).await?;
                Ok(Artifact::new(cleaned, &metadata.name, &metadata.mime_type))
            }
            ResourceClass::Video => {
                let downloaded = job_dir.join("video");
                self.video.acquire(resource, &downloaded).await?;
                Ok(Artifact::new(downloaded, &metadata.name, &metadata.mime_type))
            }
            ResourceClass::Other => {
                let downloaded = job_dir.join("passthrough");
                self.source.download_to(id, key, &downloaded).await?;
                Ok(Artifact::new(downloaded, &metadata.name, &metadata.mime_type))
            }
            ResourceClass::Folder => Err(PipelineError::NotAFolder {
                resource_id: id.to_string(),
                mime_type: metadata.mime_type.clone(),
            }),
        }
    }
}

/// A local file ready to publish.
struct Artifact {
    path: PathBuf,
    display_name: String,
    mime_type: String,
}

impl Artifact {
    fn new(path: PathBuf, display_name: &str, mime_type: &str) -> Self {
        Self {
            path,
            display_name: display_name.to_string(),
            mime_type: mime_type.to_string(),
        }
    }
}

/// Exported documents get a `.pdf` suffix unless they already have one.
fn pdf_name(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".pdf") {
        name.to_string()
    } else {
        format!("{name}.pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_mime() {
        assert_eq!(classify("application/pdf"), ResourceClass::Pdf);
        assert_eq!(classify("image/PNG"), ResourceClass::Image);
        assert_eq!(classify("image/jpeg"), ResourceClass::Image);
        assert_eq!(classify("video/mp4"), ResourceClass::Video);
        assert_eq!(
            classify("application/vnd.google-apps.folder"),
            ResourceClass::Folder
        );
        assert_eq!(
            classify("application/vnd.google-apps.document"),
            ResourceClass::Workspace
        );
        assert_eq!(
            classify("application/vnd.google-apps.form"),
            ResourceClass::Other
        );
        assert_eq!(classify("application/zip"), ResourceClass::Other);
        assert_eq!(classify("image/gif"), ResourceClass::Other);
    }

    #[test]
    fn test_pdf_name_appends_suffix_once() {
        assert_eq!(pdf_name("Week 1 notes"), "Week 1 notes.pdf");
        assert_eq!(pdf_name("slides.PDF"), "slides.PDF");
    }

    #[test]
    fn test_response_shape_for_errors() {
        let result: Result<ProcessOutcome, PipelineError> = Err(PipelineError::RemoteNotFound {
            resource_id: "gone".into(),
        });
        let response = ProcessResponse::from(&result);
        assert_eq!(response.status, "error");
        assert_eq!(response.error_kind, Some("remote_not_found"));
        assert!(response.processed_link.is_none());
    }
}
