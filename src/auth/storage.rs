//! Encrypted-at-rest credential persistence.
//!
//! One file per role under the credentials directory (`upload.enc`,
//! `download.enc`, default `$XDG_CONFIG_HOME/rehoster/credentials/`), each an
//! XChaCha20-Poly1305 sealed JSON [`CredentialRecord`].

use std::env;
use std::ffi::OsString;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use super::{CredentialRecord, Role};

/// Environment variable holding the encryption key material.
pub const MASTER_KEY_ENV: &str = "REHOSTER_MASTER_KEY";

const APP_DIR_NAME: &str = "rehoster";
const KEYRING_SERVICE: &str = "rehoster";
const KEYRING_ENTRY_NAME: &str = "credential-master-key-v1";
const MAGIC: &[u8; 4] = b"RHC1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Errors for persisted credential storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No suitable user config directory is available.
    #[error("unable to determine config directory (set XDG_CONFIG_HOME or HOME)")]
    ConfigDirUnavailable,
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Could not access keychain and no env fallback key was provided.
    #[error(
        "unable to access system keychain for credential encryption key; set REHOSTER_MASTER_KEY or configure keychain access"
    )]
    KeychainUnavailable,
    /// Stored encrypted payload is malformed.
    #[error("persisted credential payload is invalid")]
    InvalidPayload,
    /// Encryption failed.
    #[error("failed to encrypt credentials")]
    EncryptionFailed,
    /// Decryption failed.
    #[error("failed to decrypt credentials (wrong key?)")]
    DecryptionFailed,
}

/// Durable home for one credential record per role.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Loads the record for `role`, `Ok(None)` if none was ever saved.
    async fn load(&self, role: Role) -> Result<Option<CredentialRecord>, StorageError>;

    /// Persists `record`, replacing any previous record for its role.
    async fn save(&self, record: &CredentialRecord) -> Result<(), StorageError>;
}

/// File-backed store sealing each role's record with XChaCha20-Poly1305.
pub struct EncryptedFileStore {
    dir: PathBuf,
    key_material: String,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("dir", &self.dir)
            .field("key_material", &"[REDACTED]")
            .finish()
    }
}

impl EncryptedFileStore {
    /// Opens a store in `dir` using the key from [`MASTER_KEY_ENV`] or the
    /// system keychain (generated on first use).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeychainUnavailable`] if neither source works.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self::with_key(dir, load_or_create_key()?))
    }

    /// Opens a store in `dir` with explicit key material.
    #[must_use]
    pub fn with_key(dir: impl Into<PathBuf>, key_material: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key_material: key_material.into(),
        }
    }

    /// Path of the file holding `role`'s record.
    #[must_use]
    pub fn path_for(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{}.enc", role.as_str()))
    }
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    #[instrument(skip(self), fields(role = %role))]
    async fn load(&self, role: Role) -> Result<Option<CredentialRecord>, StorageError> {
        let path = self.path_for(role);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = decrypt_bytes(&bytes, &self.key_material)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    #[instrument(skip(self, record), fields(role = %record.role()))]
    async fn save(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        let plaintext = serde_json::to_vec(record)?;
        let encrypted = encrypt_bytes(&plaintext, &self.key_material)?;
        let path = self.path_for(record.role());
        write_encrypted_payload(&path, &encrypted).await?;
        debug!(path = %path.display(), "credentials persisted");
        Ok(())
    }
}

/// Process-local store, used when persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: DashMap<Role, CredentialRecord>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = CredentialRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.role(), record);
        }
        store
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, role: Role) -> Result<Option<CredentialRecord>, StorageError> {
        Ok(self.records.get(&role).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        self.records.insert(record.role(), record.clone());
        Ok(())
    }
}

/// Returns the application config directory (`$XDG_CONFIG_HOME/rehoster`).
///
/// # Errors
///
/// Returns [`StorageError::ConfigDirUnavailable`] if no usable config dir is found.
pub fn default_config_dir() -> Result<PathBuf, StorageError> {
    resolve_config_dir(
        sanitize_env_path(env::var_os("XDG_CONFIG_HOME")),
        sanitize_env_path(env::var_os("HOME")),
        sanitize_env_path(env::var_os("APPDATA")),
    )
}

fn sanitize_env_path(value: Option<OsString>) -> Option<PathBuf> {
    let value = value?;
    if value.to_string_lossy().trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(value))
}

fn resolve_config_dir(
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    app_data: Option<PathBuf>,
) -> Result<PathBuf, StorageError> {
    xdg_config_home
        .map(|xdg| xdg.join(APP_DIR_NAME))
        .or_else(|| home.map(|home| home.join(".config").join(APP_DIR_NAME)))
        .or_else(|| app_data.map(|app_data| app_data.join(APP_DIR_NAME)))
        .ok_or(StorageError::ConfigDirUnavailable)
}

fn load_or_create_key() -> Result<String, StorageError> {
    if let Some(from_env) = env::var_os(MASTER_KEY_ENV) {
        let key = from_env.to_string_lossy().trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let entry = catch_unwind(|| keyring::Entry::new(KEYRING_SERVICE, KEYRING_ENTRY_NAME))
        .map_err(|_| StorageError::KeychainUnavailable)?
        .map_err(|_| StorageError::KeychainUnavailable)?;

    let existing = catch_unwind(AssertUnwindSafe(|| entry.get_password()))
        .map_err(|_| StorageError::KeychainUnavailable)?;
    match existing {
        Ok(existing) if !existing.trim().is_empty() => Ok(existing),
        _ => {
            let generated = generate_key_material();
            catch_unwind(AssertUnwindSafe(|| entry.set_password(&generated)))
                .map_err(|_| StorageError::KeychainUnavailable)?
                .map_err(|_| StorageError::KeychainUnavailable)?;
            Ok(generated)
        }
    }
}

fn generate_key_material() -> String {
    let mut bytes = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn derive_key_bytes(key_material: &str) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(key_material.as_bytes());
    let mut key = [0_u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

async fn write_encrypted_payload(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Write then rename so a crash never leaves a truncated record behind.
    let staging = path.with_extension("enc.tmp");
    tokio::fs::write(&staging, payload).await?;
    set_owner_only_permissions(&staging).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

fn encrypt_bytes(plaintext: &[u8], key_material: &str) -> Result<Vec<u8>, StorageError> {
    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let mut nonce = [0_u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| StorageError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&nonce);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt_bytes(payload: &[u8], key_material: &str) -> Result<Vec<u8>, StorageError> {
    if payload.len() < MAGIC.len() + NONCE_LEN || &payload[..MAGIC.len()] != MAGIC {
        return Err(StorageError::InvalidPayload);
    }

    let key_bytes = derive_key_bytes(key_material);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    let (nonce, ciphertext) = payload[MAGIC.len()..].split_at(NONCE_LEN);

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| StorageError::DecryptionFailed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sample_record(role: Role) -> CredentialRecord {
        CredentialRecord::new(role, "access-abc", "refresh-xyz", Some(4_102_444_800))
    }

    #[tokio::test]
    async fn test_save_and_load_with_explicit_key() {
        let tempdir = TempDir::new().unwrap();
        let store = EncryptedFileStore::with_key(tempdir.path(), "test-key");

        store.save(&sample_record(Role::Upload)).await.unwrap();
        let loaded = store.load(Role::Upload).await.unwrap().unwrap();

        assert_eq!(loaded.access_token(), "access-abc");
        assert_eq!(loaded.refresh_token(), "refresh-xyz");
        assert_eq!(loaded.expiry(), Some(4_102_444_800));
        assert!(store.load(Role::Download).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roles_use_separate_files() {
        let tempdir = TempDir::new().unwrap();
        let store = EncryptedFileStore::with_key(tempdir.path(), "test-key");

        store.save(&sample_record(Role::Download)).await.unwrap();

        assert!(tempdir.path().join("download.enc").exists());
        assert!(!tempdir.path().join("upload.enc").exists());
    }

    #[tokio::test]
    async fn test_load_with_wrong_key_fails() {
        let tempdir = TempDir::new().unwrap();
        EncryptedFileStore::with_key(tempdir.path(), "key-a")
            .save(&sample_record(Role::Upload))
            .await
            .unwrap();

        let result = EncryptedFileStore::with_key(tempdir.path(), "key-b")
            .load(Role::Upload)
            .await;
        assert!(matches!(result, Err(StorageError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_invalid_payload_fails() {
        let tempdir = TempDir::new().unwrap();
        let store = EncryptedFileStore::with_key(tempdir.path(), "test-key");
        std::fs::write(store.path_for(Role::Upload), b"plain text").unwrap();

        let result = store.load(Role::Upload).await;
        assert!(matches!(result, Err(StorageError::InvalidPayload)));
    }

    #[tokio::test]
    async fn test_plaintext_token_not_on_disk() {
        let tempdir = TempDir::new().unwrap();
        let store = EncryptedFileStore::with_key(tempdir.path(), "test-key");
        store.save(&sample_record(Role::Upload)).await.unwrap();

        let raw = std::fs::read(store.path_for(Role::Upload)).unwrap();
        let needle = b"access-abc";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tempdir = TempDir::new().unwrap();
        let store = EncryptedFileStore::with_key(tempdir.path(), "test-key");
        store.save(&sample_record(Role::Upload)).await.unwrap();

        let mode = std::fs::metadata(store.path_for(Role::Upload))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_memory_store_replaces_record() {
        let store = MemoryCredentialStore::with_records([sample_record(Role::Upload)]);
        let rotated = CredentialRecord::new(Role::Upload, "new", "refresh-xyz", None);
        store.save(&rotated).await.unwrap();

        assert_eq!(
            store.load(Role::Upload).await.unwrap().unwrap().access_token(),
            "new"
        );
    }

    #[test]
    fn test_resolve_config_dir_prefers_xdg_over_home() {
        let resolved = resolve_config_dir(
            Some(PathBuf::from("/tmp/xdg")),
            Some(PathBuf::from("/tmp/home")),
            None,
        )
        .unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/xdg/rehoster"));
    }

    #[test]
    fn test_resolve_config_dir_falls_back_to_home() {
        let resolved = resolve_config_dir(None, Some(PathBuf::from("/tmp/home")), None).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/home/.config/rehoster"));
    }

    #[test]
    fn test_resolve_config_dir_errors_when_all_sources_missing() {
        assert!(matches!(
            resolve_config_dir(None, None, None),
            Err(StorageError::ConfigDirUnavailable)
        ));
    }

    #[test]
    fn test_sanitize_env_path_rejects_blank_values() {
        assert!(sanitize_env_path(Some(OsString::from("  "))).is_none());
    }
}
