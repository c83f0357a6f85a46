//! In-process [`RemoteStore`] for tests and dry runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{FOLDER_MIME, RemoteError, RemoteMetadata, RemoteStore};

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, (RemoteMetadata, Vec<u8>)>,
    /// Insertion order, so listings are stable.
    order: Vec<String>,
    next_id: u64,
    quota_failures: HashMap<String, u32>,
    deny_permissions: bool,
    uploads: u64,
}

impl State {
    fn stamp(&mut self) -> (String, String) {
        self.next_id += 1;
        (
            format!("mem{:06}", self.next_id),
            format!("2024-01-01T00:00:00.{:09}Z", self.next_id),
        )
    }

    fn insert(&mut self, meta: RemoteMetadata, content: Vec<u8>) {
        self.order.push(meta.resource_id.clone());
        self.entries.insert(meta.resource_id.clone(), (meta, content));
    }

    fn live(&self, id: &str) -> Result<&(RemoteMetadata, Vec<u8>), RemoteError> {
        self.entries.get(id).ok_or_else(|| RemoteError::NotFound {
            resource_id: id.to_string(),
        })
    }
}

/// Store kept entirely in memory. Ids are assigned as `mem000001`, ...
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Adds a file with a caller-chosen id.
    pub fn insert_file(&self, id: &str, name: &str, mime_type: &str, parent: &str, content: &[u8]) {
        let mut state = self.lock();
        let (_, created) = state.stamp();
        state.insert(
            RemoteMetadata {
                resource_id: id.to_string(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes: Some(content.len() as u64),
                parent_ids: vec![parent.to_string()],
                can_download: true,
                created_time: Some(created),
                trashed: false,
                resource_key: None,
            },
            content.to_vec(),
        );
    }

    /// Adds a folder with a caller-chosen id.
    pub fn insert_folder(&self, id: &str, name: &str, parent: &str) {
        self.insert_file(id, name, FOLDER_MIME, parent, &[]);
        if let Some((meta, _)) = self.lock().entries.get_mut(id) {
            meta.size_bytes = None;
        }
    }

    /// Removes `id` as if deleted out-of-band.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        state.order.retain(|existing| existing != id);
        state.entries.remove(id).is_some()
    }

    /// Marks `id` as trashed.
    pub fn trash(&self, id: &str) {
        if let Some((meta, _)) = self.lock().entries.get_mut(id) {
            meta.trashed = true;
        }
    }

    /// Makes the next `times` downloads of `id` fail with a quota error.
    pub fn fail_downloads(&self, id: &str, times: u32) {
        self.lock().quota_failures.insert(id.to_string(), times);
    }

    /// Makes every `set_public_readable` call fail.
    pub fn deny_permissions(&self, deny: bool) {
        self.lock().deny_permissions = deny;
    }

    /// Content of `id`, if present.
    #[must_use]
    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().entries.get(id).map(|(_, c)| c.clone())
    }

    /// Metadata of `id`, if present.
    #[must_use]
    pub fn metadata(&self, id: &str) -> Option<RemoteMetadata> {
        self.lock().entries.get(id).map(|(m, _)| m.clone())
    }

    /// Live, non-trashed children of `parent`.
    #[must_use]
    pub fn children(&self, parent: &str) -> Vec<RemoteMetadata> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|(meta, _)| meta)
            .filter(|meta| !meta.trashed && meta.parent_ids.iter().any(|p| p == parent))
            .cloned()
            .collect()
    }

    /// Total successful `create_file` calls.
    #[must_use]
    pub fn upload_count(&self) -> u64 {
        self.lock().uploads
    }

    fn take_quota_failure(&self, id: &str) -> Option<RemoteError> {
        let mut state = self.lock();
        let remaining = state.quota_failures.get_mut(id)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(RemoteError::QuotaExceeded {
            resource_id: id.to_string(),
            message: "downloadQuotaExceeded".to_string(),
            retry_after: None,
        })
    }

    async fn write_content(&self, id: &str, dest: &Path) -> Result<u64, RemoteError> {
        if let Some(err) = self.take_quota_failure(id) {
            return Err(err);
        }
        let content = self.lock().live(id)?.1.clone();
        tokio::fs::write(dest, &content)
            .await
            .map_err(|e| RemoteError::io(dest, e))?;
        Ok(content.len() as u64)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_metadata(
        &self,
        id: &str,
        _resource_key: Option<&str>,
    ) -> Result<RemoteMetadata, RemoteError> {
        Ok(self.lock().live(id)?.0.clone())
    }

    async fn download_to(
        &self,
        id: &str,
        _resource_key: Option<&str>,
        dest: &Path,
    ) -> Result<u64, RemoteError> {
        self.write_content(id, dest).await
    }

    async fn list_children(
        &self,
        folder_id: &str,
        _resource_key: Option<&str>,
    ) -> Result<Vec<RemoteMetadata>, RemoteError> {
        self.lock().live(folder_id)?;
        Ok(self.children(folder_id))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let id = self.lock().stamp().0;
        self.insert_folder(&id, name, parent_id);
        self.get_metadata(&id, None).await
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| RemoteError::io(source, e))?;
        let id = {
            let mut state = self.lock();
            state.uploads += 1;
            state.stamp().0
        };
        self.insert_file(&id, name, mime_type, parent_id, &content);
        self.get_metadata(&id, None).await
    }

    async fn delete_resource(&self, id: &str) -> Result<(), RemoteError> {
        if self.remove(id) {
            Ok(())
        } else {
            Err(RemoteError::NotFound {
                resource_id: id.to_string(),
            })
        }
    }

    async fn set_public_readable(&self, id: &str) -> Result<(), RemoteError> {
        let state = self.lock();
        state.live(id)?;
        if state.deny_permissions {
            return Err(RemoteError::PermissionDenied {
                resource_id: id.to_string(),
                message: "sharing disabled".to_string(),
            });
        }
        Ok(())
    }

    async fn export_as(
        &self,
        id: &str,
        _resource_key: Option<&str>,
        _target_mime: &str,
        dest: &Path,
    ) -> Result<u64, RemoteError> {
        self.write_content(id, dest).await
    }
}
