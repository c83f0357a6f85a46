//! Credential Manager: per-role OAuth tokens, refresh and persistence.
//!
//! Two roles exist: [`Role::Download`] reads source resources and
//! [`Role::Upload`] owns published artifacts. Each has exactly one live
//! [`CredentialRecord`]. Requests go through an [`AuthenticatedClient`],
//! which retries once with a refreshed token when the server answers 401.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rehoster_core::auth::{CredentialManager, EncryptedFileStore, OAuthRefresher, Role};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(EncryptedFileStore::open("/tmp/creds")?);
//! let http = reqwest::Client::new();
//! let refresher = Arc::new(OAuthRefresher::new(
//!     http.clone(),
//!     "https://oauth2.googleapis.com/token",
//!     "client-id",
//!     "client-secret",
//! ));
//! let manager = Arc::new(CredentialManager::new(store, refresher));
//! let client = manager.get_client(Role::Download, http);
//! let response = client.send(|http| http.get("https://www.googleapis.com/drive/v3/about")).await?;
//! # Ok(())
//! # }
//! ```

mod credentials;
mod refresh;
mod storage;

pub use credentials::{
    AuthenticatedClient, ClientError, CredentialError, CredentialManager, CredentialRecord,
    REFRESH_MARGIN_SECS, Role,
};
pub use refresh::{OAuthRefresher, TokenGrant, TokenRefresher};
pub use storage::{
    CredentialStore, EncryptedFileStore, MASTER_KEY_ENV, MemoryCredentialStore, StorageError,
    default_config_dir,
};
