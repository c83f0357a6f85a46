//! Publisher: destination folder resolution, duplicate purge and upload.
//!
//! Destination folders are found-or-created by exact name. When several
//! folders share a name, the most recently created one is kept and the rest
//! are deleted. Before uploading, any file with the target name in the
//! destination is deleted, so republishing never accumulates copies.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use rehoster_core::publish::Publisher;
//! use rehoster_core::remote::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! store.insert_folder("root", "root", "");
//! let publisher = Publisher::new(store, "root", "Processed");
//! let published = publisher
//!     .publish(Path::new("/tmp/clean.pdf"), "lecture.pdf", "application/pdf", Some("Physics"), &[])
//!     .await?;
//! println!("{}", published.link);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::remote::{RemoteError, RemoteMetadata, RemoteStore};

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub link: String,
    pub resource_id: String,
}

/// Uploads finished artifacts into the destination tree.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn RemoteStore>,
    root_folder_id: String,
    default_folder_name: String,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("root_folder_id", &self.root_folder_id)
            .field("default_folder_name", &self.default_folder_name)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Creates a publisher writing under `root_folder_id`; artifacts without
    /// a collection go to `default_folder_name`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RemoteStore>,
        root_folder_id: impl Into<String>,
        default_folder_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            root_folder_id: root_folder_id.into(),
            default_folder_name: default_folder_name.into(),
        }
    }

    /// The store artifacts are published to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Finds or creates `name` under `parent_id`, deleting same-name
    /// duplicates except the newest.
    ///
    /// # Errors
    ///
    /// Listing or creation failures. Failed duplicate deletes are only logged.
    #[instrument(skip(self))]
    pub async fn find_or_create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let mut existing = self.store.find_children_named(parent_id, name, true).await?;

        if existing.is_empty() {
            return self.store.create_folder(name, parent_id).await;
        }

        // Newest first; ties broken by id so the choice is deterministic.
        existing.sort_by(|a, b| {
            b.created_time
                .cmp(&a.created_time)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        let mut folders = existing.into_iter();
        let Some(keep) = folders.next() else {
            return self.store.create_folder(name, parent_id).await;
        };

        for duplicate in folders {
            info!(kept = %keep.resource_id, deleted = %duplicate.resource_id, "removing duplicate folder");
            if let Err(e) = self.store.delete_resource(&duplicate.resource_id).await {
                warn!(folder_id = %duplicate.resource_id, error = %e, "failed to delete duplicate folder");
            }
        }
        Ok(keep)
    }

    /// Resolves the destination folder for `collection` plus nested `sub_path`.
    ///
    /// # Errors
    ///
    /// See [`Self::find_or_create_folder`].
    pub async fn resolve_destination(
        &self,
        collection: Option<&str>,
        sub_path: &[String],
    ) -> Result<RemoteMetadata, RemoteError> {
        let top = collection
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.default_folder_name);
        let mut folder = self.find_or_create_folder(&self.root_folder_id, top).await?;
        for segment in sub_path {
            folder = self.find_or_create_folder(&folder.resource_id, segment).await?;
        }
        Ok(folder)
    }

    /// Uploads `local_path` as `display_name` into the destination folder
    /// and makes it publicly readable.
    ///
    /// A failure to set the permission is logged and ignored.
    ///
    /// # Errors
    ///
    /// Folder resolution or upload failures.
    #[instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub async fn publish(
        &self,
        local_path: &Path,
        display_name: &str,
        mime_type: &str,
        collection: Option<&str>,
        sub_path: &[String],
    ) -> Result<Published, RemoteError> {
        let folder = self.resolve_destination(collection, sub_path).await?;
        self.purge_named(&folder.resource_id, display_name).await?;

        let created = self
            .store
            .create_file(display_name, &folder.resource_id, local_path, mime_type)
            .await?;

        if let Err(e) = self.store.set_public_readable(&created.resource_id).await {
            warn!(resource_id = %created.resource_id, error = %e, "failed to set public permission");
        }

        let link = self.store.view_link(&created.resource_id, false);
        info!(resource_id = %created.resource_id, %link, "artifact published");
        Ok(Published {
            link,
            resource_id: created.resource_id,
        })
    }

    async fn purge_named(&self, folder_id: &str, name: &str) -> Result<(), RemoteError> {
        let stale = self.store.find_children_named(folder_id, name, false).await?;
        for file in stale.into_iter().filter(|f| !f.is_folder()) {
            debug!(resource_id = %file.resource_id, "purging same-name file before upload");
            match self.store.delete_resource(&file.resource_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::remote::MemoryStore;

    use super::*;

    fn publisher() -> (Arc<MemoryStore>, Publisher) {
        let store = Arc::new(MemoryStore::new());
        store.insert_folder("root", "root", "");
        let publisher = Publisher::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            "root",
            "Processed",
        );
        (store, publisher)
    }

    fn artifact(dir: &tempfile::TempDir, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("artifact.pdf");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_find_or_create_folder_creates_once() {
        let (store, publisher) = publisher();

        let first = publisher.find_or_create_folder("root", "Physics").await.unwrap();
        let second = publisher.find_or_create_folder("root", "Physics").await.unwrap();

        assert_eq!(first.resource_id, second.resource_id);
        assert_eq!(store.children("root").len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_folders_keep_newest() {
        let (store, publisher) = publisher();
        store.insert_folder("old", "Physics", "root");
        store.insert_folder("new", "Physics", "root");

        let kept = publisher.find_or_create_folder("root", "Physics").await.unwrap();

        assert_eq!(kept.resource_id, "new");
        assert!(store.metadata("old").is_none());
    }

    #[tokio::test]
    async fn test_publish_without_collection_uses_default_folder() {
        let (store, publisher) = publisher();
        let dir = tempfile::tempdir().unwrap();

        let published = publisher
            .publish(&artifact(&dir, b"%PDF-1"), "a.pdf", "application/pdf", None, &[])
            .await
            .unwrap();

        let folder = store.children("root").pop().unwrap();
        assert_eq!(folder.name, "Processed");
        assert_eq!(store.children(&folder.resource_id)[0].resource_id, published.resource_id);
        assert!(published.link.contains(&published.resource_id));
    }

    #[tokio::test]
    async fn test_publish_purges_same_name_file() {
        let (store, publisher) = publisher();
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(&dir, b"%PDF-1");

        let first = publisher
            .publish(&path, "a.pdf", "application/pdf", Some("Physics"), &[])
            .await
            .unwrap();
        let second = publisher
            .publish(&path, "a.pdf", "application/pdf", Some("Physics"), &[])
            .await
            .unwrap();

        assert_ne!(first.resource_id, second.resource_id);
        assert!(store.metadata(&first.resource_id).is_none());
        let folder = publisher.resolve_destination(Some("Physics"), &[]).await.unwrap();
        assert_eq!(store.children(&folder.resource_id).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_survives_permission_failure() {
        let (store, publisher) = publisher();
        store.deny_permissions(true);
        let dir = tempfile::tempdir().unwrap();

        let published = publisher
            .publish(&artifact(&dir, b"x"), "b.pdf", "application/pdf", None, &[])
            .await;

        assert!(published.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_destination_mirrors_sub_path() {
        let (store, publisher) = publisher();
        let sub_path = vec!["Week 1".to_string(), "Slides".to_string()];

        let leaf = publisher
            .resolve_destination(Some("Physics"), &sub_path)
            .await
            .unwrap();

        assert_eq!(leaf.name, "Slides");
        let week = store.metadata(&leaf.parent_ids[0]).unwrap();
        assert_eq!(week.name, "Week 1");
    }
}
