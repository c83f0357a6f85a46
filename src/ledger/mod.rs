//! Idempotency ledger: original resource → processed artifact.
//!
//! Keyed by the original resource id; at most one record per original
//! exists at any time, so writes are upserts and invalidation is a delete.
//!
//! # Example
//!
//! ```no_run
//! use rehoster_core::Database;
//! use rehoster_core::ledger::{Ledger, NewArtifactRecord, SqliteLedger};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = SqliteLedger::new(Database::new_in_memory().await?);
//! ledger
//!     .upsert(&NewArtifactRecord {
//!         original_id: "src123",
//!         original_key: None,
//!         processed_id: "out456",
//!         processed_key: None,
//!         processed_link: "https://drive.google.com/file/d/out456/view",
//!         is_folder: false,
//!     })
//!     .await?;
//! assert!(ledger.find("src123").await?.is_some());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::db::Database;

/// Ledger operation errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Query failed.
    #[error("ledger query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// One durable mapping from an original resource to its published artifact.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ProcessedArtifactRecord {
    pub original_id: String,
    pub original_key: Option<String>,
    pub processed_id: String,
    pub processed_key: Option<String>,
    pub processed_link: String,
    pub is_folder: bool,
    /// SQLite `datetime('now')` at the time of the last write.
    pub processed_at: String,
}

/// Fields supplied when recording a freshly published artifact.
#[derive(Debug, Clone, Copy)]
pub struct NewArtifactRecord<'a> {
    pub original_id: &'a str,
    pub original_key: Option<&'a str>,
    pub processed_id: &'a str,
    pub processed_key: Option<&'a str>,
    pub processed_link: &'a str,
    pub is_folder: bool,
}

/// Keyed store of processed-artifact records.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Looks up the record for `original_id`.
    async fn find(&self, original_id: &str) -> Result<Option<ProcessedArtifactRecord>, LedgerError>;

    /// Creates or replaces the record for `record.original_id`.
    async fn upsert(&self, record: &NewArtifactRecord<'_>) -> Result<(), LedgerError>;

    /// Removes the record for `original_id`; returns whether one existed.
    async fn delete(&self, original_id: &str) -> Result<bool, LedgerError>;
}

/// [`Ledger`] over the `processed_artifacts` SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db: Database,
}

impl SqliteLedger {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of records, for status output and tests.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn count(&self) -> Result<i64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_artifacts")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    #[instrument(skip(self))]
    async fn find(&self, original_id: &str) -> Result<Option<ProcessedArtifactRecord>, LedgerError> {
        let record = sqlx::query_as::<_, ProcessedArtifactRecord>(
            r"SELECT original_id, original_key, processed_id, processed_key,
                     processed_link, is_folder, processed_at
              FROM processed_artifacts
              WHERE original_id = ?",
        )
        .bind(original_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(record)
    }

    #[instrument(skip(self, record), fields(original_id = record.original_id, processed_id = record.processed_id))]
    async fn upsert(&self, record: &NewArtifactRecord<'_>) -> Result<(), LedgerError> {
        sqlx::query(
            r"INSERT INTO processed_artifacts (
                  original_id, original_key, processed_id, processed_key,
                  processed_link, is_folder, processed_at
              ) VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
              ON CONFLICT(original_id) DO UPDATE SET
                  original_key = excluded.original_key,
                  processed_id = excluded.processed_id,
                  processed_key = excluded.processed_key,
                  processed_link = excluded.processed_link,
                  is_folder = excluded.is_folder,
                  processed_at = excluded.processed_at",
        )
        .bind(record.original_id)
        .bind(record.original_key)
        .bind(record.processed_id)
        .bind(record.processed_key)
        .bind(record.processed_link)
        .bind(record.is_folder)
        .execute(self.db.pool())
        .await?;
        debug!("ledger record written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, original_id: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM processed_artifacts WHERE original_id = ?")
            .bind(original_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn ledger() -> SqliteLedger {
        SqliteLedger::new(Database::new_in_memory().await.unwrap())
    }

    fn record<'a>(original: &'a str, processed: &'a str, link: &'a str) -> NewArtifactRecord<'a> {
        NewArtifactRecord {
            original_id: original,
            original_key: Some("key-1"),
            processed_id: processed,
            processed_key: None,
            processed_link: link,
            is_folder: false,
        }
    }

    #[tokio::test]
    async fn test_find_missing_returns_none() {
        let ledger = ledger().await;
        assert!(ledger.find("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_then_find() {
        let ledger = ledger().await;
        ledger.upsert(&record("orig", "out", "link-1")).await.unwrap();

        let found = ledger.find("orig").await.unwrap().unwrap();
        assert_eq!(found.processed_id, "out");
        assert_eq!(found.processed_link, "link-1");
        assert_eq!(found.original_key.as_deref(), Some("key-1"));
        assert!(!found.is_folder);
        assert!(!found.processed_at.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_instead_of_duplicating() {
        let ledger = ledger().await;
        ledger.upsert(&record("orig", "out-1", "link-1")).await.unwrap();
        ledger.upsert(&record("orig", "out-2", "link-2")).await.unwrap();

        assert_eq!(ledger.count().await.unwrap(), 1);
        let found = ledger.find("orig").await.unwrap().unwrap();
        assert_eq!(found.processed_id, "out-2");
        assert_eq!(found.processed_link, "link-2");
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let ledger = ledger().await;
        ledger.upsert(&record("orig", "out", "link")).await.unwrap();

        assert!(ledger.delete("orig").await.unwrap());
        assert!(!ledger.delete("orig").await.unwrap());
        assert!(ledger.find("orig").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_folder_flag_round_trips() {
        let ledger = ledger().await;
        let mut folder = record("dir", "dir-out", "folder-link");
        folder.is_folder = true;
        ledger.upsert(&folder).await.unwrap();

        assert!(ledger.find("dir").await.unwrap().unwrap().is_folder);
    }
}
