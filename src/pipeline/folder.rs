//! Folder tree processing.
//!
//! Children of one folder run concurrently (bounded) but the report keeps
//! listing order. The destination mirrors the source tree under
//! `<collection or default>/<walked folder>/<sub-path>`.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{Pipeline, ProcessStatus, ResourceClass, classify};
use crate::error::PipelineError;
use crate::locator::{ResourceKind, ResourceRef};
use crate::remote::RemoteMetadata;

/// Outcome of one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Success {
        link: String,
    },
    Skip {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

/// One line of a [`ProcessingReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    /// Path relative to the walked folder, `/`-separated.
    pub path: String,
    pub resource_id: String,
    pub mime_type: String,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

impl ReportEntry {
    fn new(path: String, meta: &RemoteMetadata, outcome: EntryOutcome) -> Self {
        Self {
            path,
            resource_id: meta.resource_id.clone(),
            mime_type: meta.mime_type.clone(),
            outcome,
        }
    }

    fn failed(path: String, meta: &RemoteMetadata, error: &PipelineError) -> Self {
        Self::new(
            path,
            meta,
            EntryOutcome::Error {
                kind: error.kind(),
                message: error.to_string(),
            },
        )
    }
}

/// Per-child outcomes of a folder walk, in listing order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingReport {
    pub folder_id: String,
    pub folder_name: String,
    pub destination_link: String,
    pub entries: Vec<ReportEntry>,
}

impl ProcessingReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Success { .. }))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Skip { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Error { .. }))
    }

    /// Entry for `path`, if any.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    fn count(&self, predicate: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.outcome)).count()
    }
}

/// Where a walk currently is.
#[derive(Debug, Clone)]
struct Position<'a> {
    collection: Option<&'a str>,
    /// Destination sub-path, starting with the walked folder's name.
    sub_path: Vec<String>,
    /// Report path prefix relative to the walked folder.
    relative: String,
    depth: usize,
}

impl Position<'_> {
    fn child_path(&self, name: &str) -> String {
        if self.relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.relative)
        }
    }
}

impl Pipeline {
    /// Walks `folder`, returning the report and the mirrored destination folder.
    #[instrument(skip(self), fields(folder_id = %folder.id()))]
    pub(super) async fn walk_root(
        &self,
        folder: &ResourceRef,
        collection: Option<&str>,
    ) -> Result<(ProcessingReport, RemoteMetadata), PipelineError> {
        let meta = self
            .source
            .get_metadata(folder.id(), folder.resource_key())
            .await?;
        if !meta.is_folder() {
            return Err(PipelineError::NotAFolder {
                resource_id: meta.resource_id,
                mime_type: meta.mime_type,
            });
        }

        let sub_path = vec![meta.name.clone()];
        let destination = self
            .publisher
            .resolve_destination(collection, &sub_path)
            .await?;

        let position = Position {
            collection,
            sub_path,
            relative: String::new(),
            depth: 0,
        };
        let entries = self.walk(folder.clone(), position).await;

        let report = ProcessingReport {
            folder_id: meta.resource_id,
            folder_name: meta.name,
            destination_link: self.publisher.store().view_link(&destination.resource_id, true),
            entries,
        };
        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "folder walk finished"
        );
        Ok((report, destination))
    }

    /// Lists `folder` and processes its children; never fails as a whole.
    fn walk<'a>(
        &'a self,
        folder: ResourceRef,
        position: Position<'a>,
    ) -> BoxFuture<'a, Vec<ReportEntry>> {
        async move {
            let children = match self
                .source
                .list_children(folder.id(), folder.resource_key())
                .await
            {
                Ok(children) => children,
                Err(e) => {
                    let error = PipelineError::from(e);
                    warn!(folder_id = %folder.id(), error = %error, "failed to list folder");
                    let meta = RemoteMetadata {
                        resource_id: folder.id().to_string(),
                        mime_type: crate::remote::FOLDER_MIME.to_string(),
                        ..RemoteMetadata::default()
                    };
                    return vec![ReportEntry::failed(position.relative.clone(), &meta, &error)];
                }
            };

            let position = &position;
            stream::iter(children)
                .map(|child| self.process_child(child, position))
                .buffered(self.folder_concurrency)
                .collect::<Vec<Vec<ReportEntry>>>()
                .await
                .into_iter()
                .flatten()
                .collect()
        }
        .boxed()
    }

    async fn process_child(&self, child: RemoteMetadata, position: &Position<'_>) -> Vec<ReportEntry> {
        let path = position.child_path(&child.name);

        match classify(&child.mime_type) {
            ResourceClass::Folder => self.process_subfolder(child, path, position).await,
            ResourceClass::Other => vec![ReportEntry::new(
                path,
                &child,
                EntryOutcome::Skip {
                    reason: format!("unsupported type {}", child.mime_type),
                    link: None,
                },
            )],
            _ => {
                let resource = ResourceRef::from_listing(
                    child.resource_id.clone(),
                    child.resource_key.clone(),
                    ResourceKind::File,
                );
                let outcome = self
                    .process_file(
                        &resource,
                        Some(child.clone()),
                        position.collection,
                        &position.sub_path,
                    )
                    .await;
                let entry = match outcome {
                    Ok(done) if done.status == ProcessStatus::Skipped => ReportEntry::new(
                        path,
                        &child,
                        EntryOutcome::Skip {
                            reason: "already processed".to_string(),
                            link: Some(done.processed_link),
                        },
                    ),
                    Ok(done) => ReportEntry::new(
                        path,
                        &child,
                        EntryOutcome::Success {
                            link: done.processed_link,
                        },
                    ),
                    Err(e) => {
                        warn!(path = %path, error = %e, "child failed, continuing with siblings");
                        ReportEntry::failed(path, &child, &e)
                    }
                };
                vec![entry]
            }
        }
    }

    async fn process_subfolder(
        &self,
        child: RemoteMetadata,
        path: String,
        position: &Position<'_>,
    ) -> Vec<ReportEntry> {
        let depth = position.depth + 1;
        if depth > self.max_folder_depth {
            let error = PipelineError::DepthExceeded {
                resource_id: child.resource_id.clone(),
                max_depth: self.max_folder_depth,
            };
            return vec![ReportEntry::failed(path, &child, &error)];
        }

        let mut sub_path = position.sub_path.clone();
        sub_path.push(child.name.clone());
        let destination = match self
            .publisher
            .resolve_destination(position.collection, &sub_path)
            .await
        {
            Ok(folder) => folder,
            Err(e) => return vec![ReportEntry::failed(path, &child, &e.into())],
        };

        let folder = ResourceRef::from_listing(
            child.resource_id.clone(),
            child.resource_key.clone(),
            ResourceKind::Folder,
        );
        let link = self.publisher.store().view_link(&destination.resource_id, true);
        let nested = Position {
            collection: position.collection,
            sub_path,
            relative: path.clone(),
            depth,
        };

        let mut entries = vec![ReportEntry::new(path, &child, EntryOutcome::Success { link })];
        entries.extend(self.walk(folder, nested).await);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts() {
        let meta = RemoteMetadata::default();
        let report = ProcessingReport {
            entries: vec![
                ReportEntry::new("a".into(), &meta, EntryOutcome::Success { link: "l".into() }),
                ReportEntry::new(
                    "b".into(),
                    &meta,
                    EntryOutcome::Skip {
                        reason: "unsupported".into(),
                        link: None,
                    },
                ),
                ReportEntry::new(
                    "c".into(),
                    &meta,
                    EntryOutcome::Error {
                        kind: "io",
                        message: "boom".into(),
                    },
                ),
            ],
            ..ProcessingReport::default()
        };

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.entry("b").is_some());
    }

    #[test]
    fn test_entry_serializes_flat() {
        let meta = RemoteMetadata {
            resource_id: "x".into(),
            mime_type: "application/pdf".into(),
            ..RemoteMetadata::default()
        };
        let entry = ReportEntry::new("x.pdf".into(), &meta, EntryOutcome::Success { link: "L".into() });
        let json = serde_json::to_value(&entry).unwrap_or_default();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["link"], "L");
        assert_eq!(json["path"], "x.pdf");
    }
}
