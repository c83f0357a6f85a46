//! Auth command handlers: store and inspect per-role credentials.

use std::io::{self, IsTerminal, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rehoster_core::RuntimeSettings;
use rehoster_core::auth::{CredentialRecord, CredentialStore, EncryptedFileStore, Role};
use tracing::info;

pub async fn run_auth_set(
    settings: &RuntimeSettings,
    role: Role,
    refresh_token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<i64>,
) -> Result<()> {
    let refresh_token = match refresh_token {
        Some(token) => token,
        None => read_token_from_stdin()?,
    };

    // Without an access token, expiry 0 forces a refresh on first use.
    let (access_token, expiry) = match access_token {
        Some(token) => (token, expires_in.map(|secs| unix_now().saturating_add(secs))),
        None => (String::new(), Some(0)),
    };

    let store = EncryptedFileStore::open(&settings.credentials_dir)
        .context("Failed to open credential storage")?;
    let record = CredentialRecord::new(role, access_token, refresh_token, expiry);
    store
        .save(&record)
        .await
        .with_context(|| format!("Failed to store {role} credentials"))?;

    info!(
        role = %role,
        path = %store.path_for(role).display(),
        "Saved encrypted credentials"
    );
    Ok(())
}

pub async fn run_auth_status(settings: &RuntimeSettings) -> Result<()> {
    let store = EncryptedFileStore::open(&settings.credentials_dir)
        .context("Failed to open credential storage")?;
    let now = unix_now();

    for role in Role::ALL {
        let line = match store.load(role).await {
            Ok(Some(record)) => match record.expiry() {
                Some(_) if record.expires_soon(now) => format!("{role}: stored (access token stale)"),
                Some(at) => format!("{role}: stored (valid for {}s)", at - now),
                None => format!("{role}: stored"),
            },
            Ok(None) => format!("{role}: missing"),
            Err(e) => format!("{role}: unreadable ({e})"),
        };
        println!("{line}");
    }
    Ok(())
}

fn read_token_from_stdin() -> Result<String> {
    if io::stdin().is_terminal() {
        info!("Paste the refresh token, then press Enter:");
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        return non_empty(&line);
    }

    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    non_empty(&buffer)
}

fn non_empty(raw: &str) -> Result<String> {
    let token = raw.trim();
    if token.is_empty() {
        bail!("No refresh token provided");
    }
    Ok(token.to_string())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_trims_token() {
        assert_eq!(non_empty("  1//abc \n").ok().as_deref(), Some("1//abc"));
    }

    #[test]
    fn test_non_empty_rejects_blank() {
        assert!(non_empty(" \n").is_err());
    }
}
