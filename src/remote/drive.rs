//! HTTP implementation of [`RemoteStore`] against the Drive v3 REST API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{FOLDER_MIME, RemoteError, RemoteMetadata, RemoteStore, stream_to_file};
use crate::auth::AuthenticatedClient;
use crate::retry::{RetryPolicy, parse_retry_after, retry_with_hint};

/// Default metadata/content API root.
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Default upload API root.
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const METADATA_FIELDS: &str =
    "id,name,mimeType,size,parents,capabilities/canDownload,createdTime,trashed,resourceKey";
const LIST_PAGE_SIZE: &str = "1000";
const RESOURCE_KEYS_HEADER: &str = "X-Goog-Drive-Resource-Keys";

/// Reasons in a 403 body that mean "slow down", not "no access".
const QUOTA_REASONS: [&str; 4] = [
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "downloadQuotaExceeded",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    capabilities: Option<Capabilities>,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    trashed: bool,
    #[serde(default)]
    resource_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Capabilities {
    #[serde(default)]
    can_download: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl From<DriveFile> for RemoteMetadata {
    fn from(file: DriveFile) -> Self {
        Self {
            resource_id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            size_bytes: file.size.and_then(|s| s.parse().ok()),
            parent_ids: file.parents,
            can_download: file
                .capabilities
                .and_then(|c| c.can_download)
                .unwrap_or(true),
            created_time: file.created_time,
            trashed: file.trashed,
            resource_key: file.resource_key,
        }
    }
}

/// Drive v3 client bound to one account role.
#[derive(Debug, Clone)]
pub struct DriveClient {
    client: AuthenticatedClient,
    api_base: String,
    upload_base: String,
    quota_policy: RetryPolicy,
}

impl DriveClient {
    /// Creates a client against the public API endpoints.
    #[must_use]
    pub fn new(client: AuthenticatedClient) -> Self {
        Self::with_endpoints(client, DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE)
    }

    /// Creates a client against custom endpoints.
    #[must_use]
    pub fn with_endpoints(
        client: AuthenticatedClient,
        api_base: impl Into<String>,
        upload_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_base: upload_base.into().trim_end_matches('/').to_string(),
            quota_policy: RetryPolicy::default(),
        }
    }

    /// Overrides the backoff used for quota and transient server errors.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.quota_policy = policy;
        self
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, urlencoding::encode(id))
    }

    /// Sends the request with auth, retrying quota and transient failures.
    async fn execute<F>(
        &self,
        operation: &'static str,
        resource_id: &str,
        build: F,
    ) -> Result<Response, RemoteError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let build = &build;
        let this = self;
        retry_with_hint(
            &self.quota_policy,
            RemoteError::failure_type,
            RemoteError::retry_after,
            move |_attempt| async move {
                let response = this
                    .client
                    .send(build)
                    .await
                    .map_err(|e| RemoteError::from_client(operation, e))?;
                check_status(response, operation, resource_id).await
            },
        )
        .await
        .map_err(crate::retry::RetryError::into_inner)
    }

    async fn fetch_list_page(
        &self,
        query: &str,
        fields: &str,
        page_token: Option<&str>,
        resource_key_header: Option<&str>,
        folder_id: &str,
    ) -> Result<FileList, RemoteError> {
        let url = format!("{}/files", self.api_base);
        let response = self
            .execute("list_children", folder_id, |http| {
                let mut request = http.get(&url).query(&[
                    ("q", query),
                    ("fields", fields),
                    ("pageSize", LIST_PAGE_SIZE),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                    ("orderBy", "folder,name"),
                ]);
                if let Some(token) = page_token {
                    request = request.query(&[("pageToken", token)]);
                }
                with_resource_key(request, resource_key_header)
            })
            .await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::decode("list_children", e.to_string()))
    }

    async fn list_query(
        &self,
        folder_id: &str,
        query: &str,
        resource_key: Option<&str>,
    ) -> Result<Vec<RemoteMetadata>, RemoteError> {
        let fields = format!("nextPageToken,files({METADATA_FIELDS})");
        let key_header = resource_key.map(|key| format!("{folder_id}/{key}"));
        let mut page_token: Option<String> = None;
        let mut children = Vec::new();

        loop {
            let page = self
                .fetch_list_page(
                    query,
                    &fields,
                    page_token.as_deref(),
                    key_header.as_deref(),
                    folder_id,
                )
                .await?;
            children.extend(page.files.into_iter().map(RemoteMetadata::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(children)
    }

    async fn upload_session(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        length: u64,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/files", self.upload_base);
        let metadata = json!({ "name": name, "parents": [parent_id] });
        let response = self
            .execute("create_file", parent_id, |http| {
                http.post(&url)
                    .query(&[
                        ("uploadType", "resumable"),
                        ("supportsAllDrives", "true"),
                        ("fields", METADATA_FIELDS),
                    ])
                    .header("X-Upload-Content-Type", mime_type)
                    .header("X-Upload-Content-Length", length)
                    .json(&metadata)
            })
            .await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::decode("create_file", "upload session has no Location"))
    }
}

fn with_resource_key(request: RequestBuilder, header_value: Option<&str>) -> RequestBuilder {
    match header_value {
        Some(value) => request.header(RESOURCE_KEYS_HEADER, value),
        None => request,
    }
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Maps a non-success response to a typed error.
pub(crate) async fn check_status(
    response: Response,
    operation: &'static str,
    resource_id: &str,
) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after: Option<Duration> = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let message: String = body.chars().take(300).collect();
    debug!(status = status.as_u16(), operation, resource_id, "remote call failed");

    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound {
            resource_id: resource_id.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::QuotaExceeded {
            resource_id: resource_id.to_string(),
            message,
            retry_after,
        },
        StatusCode::FORBIDDEN if QUOTA_REASONS.iter().any(|r| body.contains(r)) => {
            RemoteError::QuotaExceeded {
                resource_id: resource_id.to_string(),
                message,
                retry_after,
            }
        }
        StatusCode::FORBIDDEN => RemoteError::PermissionDenied {
            resource_id: resource_id.to_string(),
            message,
        },
        _ => RemoteError::Http {
            status: status.as_u16(),
            operation,
            message,
        },
    })
}

#[async_trait]
impl RemoteStore for DriveClient {
    #[instrument(skip(self, resource_key), fields(role = %self.client.role()))]
    async fn get_metadata(
        &self,
        id: &str,
        resource_key: Option<&str>,
    ) -> Result<RemoteMetadata, RemoteError> {
        let url = self.file_url(id);
        let key_header = resource_key.map(|key| format!("{id}/{key}"));
        let response = self
            .execute("get_metadata", id, |http| {
                with_resource_key(
                    http.get(&url).query(&[
                        ("fields", METADATA_FIELDS),
                        ("supportsAllDrives", "true"),
                    ]),
                    key_header.as_deref(),
                )
            })
            .await?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| RemoteError::decode("get_metadata", e.to_string()))?;
        Ok(file.into())
    }

    #[instrument(skip(self, resource_key, dest), fields(dest = %dest.display()))]
    async fn download_to(
        &self,
        id: &str,
        resource_key: Option<&str>,
        dest: &Path,
    ) -> Result<u64, RemoteError> {
        let url = self.file_url(id);
        let key_header = resource_key.map(|key| format!("{id}/{key}"));
        let response = self
            .execute("download", id, |http| {
                with_resource_key(
                    http.get(&url)
                        .query(&[("alt", "media"), ("supportsAllDrives", "true")]),
                    key_header.as_deref(),
                )
            })
            .await?;
        let bytes = stream_to_file(response, dest, "download", |_| {}).await?;
        debug!(bytes, "download complete");
        Ok(bytes)
    }

    #[instrument(skip(self, resource_key))]
    async fn list_children(
        &self,
        folder_id: &str,
        resource_key: Option<&str>,
    ) -> Result<Vec<RemoteMetadata>, RemoteError> {
        let query = format!(
            "'{}' in parents and trashed = false",
            escape_query_literal(folder_id)
        );
        let children = self.list_query(folder_id, &query, resource_key).await?;
        debug!(count = children.len(), "listed children");
        Ok(children)
    }

    #[instrument(skip(self))]
    async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let url = format!("{}/files", self.api_base);
        let body = json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent_id] });
        let response = self
            .execute("create_folder", parent_id, |http| {
                http.post(&url)
                    .query(&[("fields", METADATA_FIELDS), ("supportsAllDrives", "true")])
                    .json(&body)
            })
            .await?;
        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| RemoteError::decode("create_folder", e.to_string()))?;
        info!(folder_id = %file.id, "folder created");
        Ok(file.into())
    }

    #[instrument(skip(self, source), fields(source = %source.display()))]
    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        source: &Path,
        mime_type: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        let length = tokio::fs::metadata(source)
            .await
            .map_err(|e| RemoteError::io(source, e))?
            .len();
        let session_url = self.upload_session(name, parent_id, mime_type, length).await?;

        // The session URL carries its own authority; no bearer token.
        let file = tokio::fs::File::open(source)
            .await
            .map_err(|e| RemoteError::io(source, e))?;
        let response = self
            .client
            .http()
            .put(&session_url)
            .header(CONTENT_TYPE, mime_type)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .map_err(|e| RemoteError::network("create_file", e))?;
        let response = check_status(response, "create_file", parent_id).await?;

        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| RemoteError::decode("create_file", e.to_string()))?;
        info!(file_id = %file.id, bytes = length, "file uploaded");
        Ok(file.into())
    }

    #[instrument(skip(self))]
    async fn delete_resource(&self, id: &str) -> Result<(), RemoteError> {
        let url = self.file_url(id);
        self.execute("delete", id, |http| {
            http.delete(&url).query(&[("supportsAllDrives", "true")])
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_public_readable(&self, id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/permissions", self.file_url(id));
        let body = json!({ "role": "reader", "type": "anyone" });
        self.execute("set_public_readable", id, |http| {
            http.post(&url)
                .query(&[("supportsAllDrives", "true")])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self, resource_key, dest), fields(dest = %dest.display()))]
    async fn export_as(
        &self,
        id: &str,
        resource_key: Option<&str>,
        target_mime: &str,
        dest: &Path,
    ) -> Result<u64, RemoteError> {
        let url = format!("{}/export", self.file_url(id));
        let key_header = resource_key.map(|key| format!("{id}/{key}"));
        let response = self
            .execute("export", id, |http| {
                with_resource_key(
                    http.get(&url).query(&[("mimeType", target_mime)]),
                    key_header.as_deref(),
                )
            })
            .await?;
        stream_to_file(response, dest, "export", |_| {}).await
    }

    #[instrument(skip(self))]
    async fn find_children_named(
        &self,
        parent_id: &str,
        name: &str,
        folders_only: bool,
    ) -> Result<Vec<RemoteMetadata>, RemoteError> {
        let mut query = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            escape_query_literal(parent_id),
            escape_query_literal(name)
        );
        if folders_only {
            query.push_str(&format!(" and mimeType = '{FOLDER_MIME}'"));
        }
        self.list_query(parent_id, &query, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_query_literal_quotes_and_backslashes() {
        assert_eq!(escape_query_literal("it's"), "it\\'s");
        assert_eq!(escape_query_literal("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_drive_file_conversion_parses_size_and_capabilities() {
        let file: DriveFile = serde_json::from_value(json!({
            "id": "abc",
            "name": "notes.pdf",
            "mimeType": "application/pdf",
            "size": "2048",
            "parents": ["root1"],
            "capabilities": { "canDownload": false },
            "createdTime": "2024-05-01T10:00:00.000Z"
        }))
        .unwrap_or_else(|e| panic!("{e}"));
        let meta = RemoteMetadata::from(file);

        assert_eq!(meta.size_bytes, Some(2048));
        assert!(!meta.can_download);
        assert!(!meta.trashed);
        assert_eq!(meta.parent_ids, vec!["root1".to_string()]);
    }
}
