//! Duplicate/idempotency guard.
//!
//! Decides, before any work starts, whether an original resource already
//! has a live processed artifact. A record whose artifact has vanished
//! upstream (deleted or trashed) is removed so the resource is reprocessed.
//!
//! The check is not atomic with publishing. Two concurrent jobs for the same
//! resource may both see [`Decision::New`]; the publisher's same-name purge
//! converges them to one surviving artifact.

use tracing::{debug, info, instrument};

use crate::ledger::{Ledger, LedgerError, ProcessedArtifactRecord};
use crate::locator::ResourceRef;
use crate::remote::{RemoteError, RemoteStore};

/// Outcome of [`check_and_decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A live artifact exists; reuse it.
    Skip {
        /// Link of the existing artifact.
        existing_link: String,
        /// The ledger record that was confirmed live.
        record: ProcessedArtifactRecord,
    },
    /// A record existed but its artifact is gone; the record was removed.
    Reprocess,
    /// Never processed.
    New,
}

/// Errors from the guard. Not-found is never one of them.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Looks up `resource` in the ledger and verifies the artifact upstream.
///
/// `dest` is the store holding processed artifacts.
///
/// # Errors
///
/// Ledger failures, and remote failures other than not-found.
#[instrument(skip(ledger, dest), fields(resource_id = %resource.id()))]
pub async fn check_and_decide(
    resource: &ResourceRef,
    ledger: &dyn Ledger,
    dest: &dyn RemoteStore,
) -> Result<Decision, GuardError> {
    let Some(record) = ledger.find(resource.id()).await? else {
        debug!("no ledger record");
        return Ok(Decision::New);
    };

    let gone = match dest
        .get_metadata(&record.processed_id, record.processed_key.as_deref())
        .await
    {
        Ok(meta) => meta.trashed,
        Err(e) if e.is_not_found() => true,
        Err(e) => return Err(e.into()),
    };

    if gone {
        info!(processed_id = %record.processed_id, "processed artifact gone upstream, invalidating record");
        ledger.delete(resource.id()).await?;
        return Ok(Decision::Reprocess);
    }

    debug!(processed_id = %record.processed_id, "processed artifact still live");
    Ok(Decision::Skip {
        existing_link: record.processed_link.clone(),
        record,
    })
}
