//! Remote Store Client: the capability surface over the storage API.
//!
//! [`RemoteStore`] is the seam every other component talks through;
//! [`DriveClient`] implements it over HTTP. Every call accepts the optional
//! resource key needed for shared-with-link resources.

mod drive;
mod error;
mod memory;

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};

pub use drive::{DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE, DriveClient};
pub(crate) use drive::check_status;
pub use error::RemoteError;
pub use memory::MemoryStore;

/// MIME type the store uses for folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// MIME prefix shared by Workspace-native documents.
pub const WORKSPACE_MIME_PREFIX: &str = "application/vnd.google-apps.";

/// MIME type of PDF output.
pub const PDF_MIME: &str = "application/pdf";

/// Metadata for one remote resource. Fetched fresh per operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RemoteMetadata {
    pub resource_id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: Option<u64>,
    pub parent_ids: Vec<String>,
    pub can_download: bool,
    /// RFC 3339 creation timestamp as reported by the store.
    pub created_time: Option<String>,
    pub trashed: bool,
    pub resource_key: Option<String>,
}

impl RemoteMetadata {
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

/// Operations the pipeline needs from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches current metadata for `id`.
    async fn get_metadata(
        &self,
        id: &str,
        resource_key: Option<&str>,
    ) -> Result<RemoteMetadata, RemoteError>;

    /// Streams the content of `id` into `dest`, returning bytes written.
    async fn download_to(
        &self,
        id: &str,
        resource_key: Option<&str>,
        dest: &Path,
    ) -> Result<u64, RemoteError>;

    /// Lists the non-trashed children of `folder_id`, in store order.
    async fn list_children(
        &self,
        folder_id: &str,
        resource_key: Option<&str>,
    ) -> Result<Vec<RemoteMetadata>, RemoteError>;

    /// Creates a folder named `name` under `parent_id`.
    async fn create_folder(&self, name: &str, parent_id: &str)
    -> Result<RemoteMetadata, RemoteError>;

    /// Uploads `source` as a new file named `name` under `parent_id`.
    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<RemoteMetadata, RemoteError>;

    /// Deletes `id` permanently.
    async fn delete_resource(&self, id: &str) -> Result<(), RemoteError>;

    /// Grants anyone-with-the-link read access to `id`.
    async fn set_public_readable(&self, id: &str) -> Result<(), RemoteError>;

    /// Exports a Workspace-native document as `target_mime` into `dest`.
    async fn export_as(
        &self,
        id: &str,
        resource_key: Option<&str>,
        target_mime: &str,
        dest: &Path,
    ) -> Result<u64, RemoteError>;

    /// Children of `parent_id` whose name is exactly `name`.
    async fn find_children_named(
        &self,
        parent_id: &str,
        name: &str,
        folders_only: bool,
    ) -> Result<Vec<RemoteMetadata>, RemoteError> {
        Ok(self
            .list_children(parent_id, None)
            .await?
            .into_iter()
            .filter(|child| child.name == name && (!folders_only || child.is_folder()))
            .collect())
    }

    /// Canonical share link for a resource.
    fn view_link(&self, id: &str, is_folder: bool) -> String {
        if is_folder {
            format!("https://drive.google.com/drive/folders/{id}")
        } else {
            format!("https://drive.google.com/file/d/{id}/view")
        }
    }
}

/// Writes a response body to `dest` chunk by chunk.
///
/// `on_progress` receives the running byte count after each chunk. A
/// partially written file is removed on failure.
pub(crate) async fn stream_to_file<P>(
    response: reqwest::Response,
    dest: &Path,
    operation: &'static str,
    mut on_progress: P,
) -> Result<u64, RemoteError>
where
    P: FnMut(u64) + Send,
{
    let file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| RemoteError::io(dest, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    let result = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RemoteError::network(operation, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| RemoteError::io(dest, e))?;
            bytes_written += chunk.len() as u64;
            on_progress(bytes_written);
        }
        writer.flush().await.map_err(|e| RemoteError::io(dest, e))
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(e);
    }
    Ok(bytes_written)
}
