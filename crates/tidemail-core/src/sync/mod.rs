//! Keeping local mailboxes in step with the remote server.
//!
//! - [`MailboxReconciler`] mirrors the folder list and seeds sync cursors.
//! - [`BackfillEngine`] walks each folder's history backward in windows.
//! - [`DeltaEngine`] fetches what arrived above the high-water mark once
//!   history is complete.

mod backfill;
mod delta;
mod reconcile;

use tidemail_imap::{FolderStatus, UidValidity};
use tracing::warn;

pub use backfill::{BackfillEngine, BackfillOutcome, plan_windows};
pub use delta::{DeltaEngine, DeltaOutcome, plan_batches};
pub use reconcile::{MailboxReconciler, ReconcileReport};

use crate::identity::{IdentityId, IdentityRepository};
use crate::mailbox::{Mailbox, MailboxId, MailboxRepository, SyncCursor};
use crate::session::{ConnectionManager, SessionHandle};
use crate::{Error, Result};

/// A mailbox ready to be synchronized: its record, remote path, cursor and
/// the identity's session.
struct SyncTarget {
    mailbox: Mailbox,
    path: String,
    cursor: SyncCursor,
    session: SessionHandle,
}

/// Loads everything a sync run needs, or `None` when the mailbox has no
/// remote folder to sync.
async fn load_target(
    mailboxes: &MailboxRepository,
    identities: &IdentityRepository,
    connections: &ConnectionManager,
    identity_id: IdentityId,
    mailbox_id: MailboxId,
) -> Result<Option<SyncTarget>> {
    let mailbox = mailboxes.require(mailbox_id).await?;
    if mailbox.identity_id != identity_id {
        return Err(Error::NotFound(format!(
            "mailbox {mailbox_id} of identity {identity_id}"
        )));
    }
    let Some(path) = mailbox.remote_path.clone().filter(|_| mailbox.selectable) else {
        return Ok(None);
    };

    let cursor = mailboxes
        .get_cursor(identity_id, mailbox_id)
        .await?
        .unwrap_or_else(|| SyncCursor::bootstrap(identity_id, mailbox_id));
    let identity = identities.require(identity_id).await?;
    let session = connections.session(&identity)?;

    Ok(Some(SyncTarget {
        mailbox,
        path,
        cursor,
        session,
    }))
}

fn validity_of(status: &FolderStatus) -> Option<u32> {
    status.uid_validity.map(UidValidity::get)
}

/// Resets the cursor if the folder's UID epoch moved. Returns true on reset.
fn check_validity(cursor: &mut SyncCursor, status: &FolderStatus) -> bool {
    let current = validity_of(status);
    match (cursor.uid_validity, current) {
        (Some(known), Some(now)) if known != now => {
            warn!(
                identity_id = %cursor.identity_id,
                mailbox_id = %cursor.mailbox_id,
                known,
                now,
                "UIDVALIDITY changed, restarting mailbox sync"
            );
            cursor.reset_for_validity(current, status.head_uid());
            true
        }
        (None, Some(_)) => {
            cursor.uid_validity = current;
            false
        }
        _ => false,
    }
}
