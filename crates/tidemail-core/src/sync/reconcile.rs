//! Mirroring the remote folder list into local mailboxes.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use tidemail_imap::{FolderInfo, SpecialUse};

use super::validity_of;
use crate::db::Database;
use crate::identity::{Identity, IdentityId, IdentityRepository};
use crate::mailbox::{Mailbox, MailboxId, MailboxKind, MailboxRepository, SyncCursor, slugify};
use crate::session::{ConnectionManager, SessionHandle};
use crate::{Error, Result};

/// Remote path of the Trash folder created when the server has none.
const TRASH_PATH: &str = "Trash";

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Mailboxes created for newly discovered folders.
    pub created: Vec<MailboxId>,
    /// Existing mailboxes whose metadata changed.
    pub updated: usize,
    /// Mailboxes marked non-selectable.
    pub tombstoned: usize,
    /// Trash mailbox created by this pass, remote or local-only.
    pub trash: Option<MailboxId>,
}

/// Keeps an identity's mailboxes in step with the server's folder list.
#[derive(Debug, Clone)]
pub struct MailboxReconciler {
    mailboxes: MailboxRepository,
    identities: IdentityRepository,
    connections: ConnectionManager,
}

/// Slugs and default roles already taken by an identity.
struct Claims {
    slugs: HashSet<String>,
    defaults: HashSet<MailboxKind>,
}

impl Claims {
    fn new(existing: &[Mailbox]) -> Self {
        Self {
            slugs: existing.iter().map(|m| m.slug.clone()).collect(),
            defaults: existing
                .iter()
                .filter(|m| m.is_default)
                .map(|m| m.kind)
                .collect(),
        }
    }

    /// First free slug among `base`, `base-2`, `base-3`, ...
    fn slug(&mut self, base: &str) -> String {
        let mut slug = base.to_string();
        let mut n = 2;
        while self.slugs.contains(&slug) {
            slug = format!("{base}-{n}");
            n += 1;
        }
        self.slugs.insert(slug.clone());
        slug
    }

    /// Claims the default role for `kind` if nobody holds it yet.
    fn default_for(&mut self, kind: MailboxKind) -> bool {
        kind != MailboxKind::Custom && self.defaults.insert(kind)
    }
}

impl MailboxReconciler {
    /// Creates the reconciler.
    #[must_use]
    pub fn new(db: &Database, connections: ConnectionManager) -> Self {
        Self {
            mailboxes: MailboxRepository::new(db),
            identities: IdentityRepository::new(db),
            connections,
        }
    }

    /// Lists the identity's remote folders and brings local mailboxes and
    /// sync cursors in line.
    ///
    /// Existing cursors are never modified. Mailboxes are never deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder listing or the database fails.
    pub async fn reconcile(&self, identity_id: IdentityId) -> Result<ReconcileReport> {
        let identity = self.identities.require(identity_id).await?;
        let session = self.connections.session(&identity)?;
        let folders = session.list_folders().await?;
        let existing = self.mailboxes.list(identity_id).await?;

        let mut claims = Claims::new(&existing);
        let mut report = ReconcileReport::default();

        for folder in &folders {
            let known = existing
                .iter()
                .find(|m| m.remote_path.as_deref() == Some(folder.path.as_str()));
            match known {
                Some(mailbox) => self.refresh(&session, mailbox, folder, &mut report).await?,
                None if folder.selectable => {
                    let id = self
                        .create(&identity, &session, folder, &mut claims)
                        .await?;
                    report.created.push(id);
                }
                None => debug!(%identity_id, path = %folder.path, "skipping non-selectable folder"),
            }
        }

        let listed: HashSet<&str> = folders.iter().map(|f| f.path.as_str()).collect();
        for mailbox in &existing {
            let Some(path) = mailbox.remote_path.as_deref() else {
                continue;
            };
            if mailbox.selectable && !listed.contains(path) {
                if let Some(id) = mailbox.id {
                    self.mailboxes.set_selectable(id, false).await?;
                    info!(%identity_id, mailbox_id = %id, path, "folder vanished remotely");
                    report.tombstoned += 1;
                }
            }
        }

        let remote_trash = folders
            .iter()
            .any(|f| f.selectable && MailboxKind::classify(f) == MailboxKind::Trash);
        if !remote_trash
            && self
                .mailboxes
                .find_by_kind(identity_id, MailboxKind::Trash)
                .await?
                .is_none()
        {
            report.trash = Some(self.create_trash(&identity, &session, &folders, &mut claims).await?);
        }

        info!(
            %identity_id,
            folders = folders.len(),
            created = report.created.len(),
            updated = report.updated,
            tombstoned = report.tombstoned,
            "mailboxes reconciled"
        );
        Ok(report)
    }

    async fn refresh(
        &self,
        session: &SessionHandle,
        mailbox: &Mailbox,
        folder: &FolderInfo,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let fresh = Mailbox {
            name: folder.name().to_string(),
            delimiter: folder.delimiter.clone(),
            remote_flags: folder.attributes.clone(),
            special_use: folder.special_use.map(|s| s.as_str().to_string()),
            selectable: folder.selectable,
            ..mailbox.clone()
        };
        if fresh != *mailbox {
            self.mailboxes.update_metadata(&fresh).await?;
            if mailbox.selectable && !fresh.selectable {
                report.tombstoned += 1;
            } else {
                report.updated += 1;
            }
        }

        if let Some(id) = fresh.id.filter(|_| fresh.selectable) {
            if self.mailboxes.get_cursor(fresh.identity_id, id).await?.is_none() {
                self.seed(session, fresh.identity_id, id, &folder.path).await?;
            }
        }
        Ok(())
    }

    async fn create(
        &self,
        identity: &Identity,
        session: &SessionHandle,
        folder: &FolderInfo,
        claims: &mut Claims,
    ) -> Result<MailboxId> {
        let identity_id = identity
            .id
            .ok_or_else(|| Error::NotFound("unsaved identity".into()))?;
        let kind = MailboxKind::classify(folder);
        let mut mailbox = Mailbox {
            id: None,
            identity_id,
            owner_id: identity.owner_id.clone(),
            name: folder.name().to_string(),
            slug: claims.slug(&slugify(&folder.path)),
            kind,
            is_default: claims.default_for(kind),
            remote_path: Some(folder.path.clone()),
            delimiter: folder.delimiter.clone(),
            remote_flags: folder.attributes.clone(),
            special_use: folder.special_use.map(|s| s.as_str().to_string()),
            selectable: folder.selectable,
        };
        self.mailboxes.insert(&mut mailbox).await?;
        let id = mailbox
            .id
            .ok_or_else(|| Error::NotFound("inserted mailbox".into()))?;

        info!(%identity_id, mailbox_id = %id, path = %folder.path, kind = kind.as_str(), "mailbox discovered");
        self.seed(session, identity_id, id, &folder.path).await?;
        Ok(id)
    }

    /// Creates a Trash folder on the server, or a local-only Trash mailbox
    /// when the server refuses.
    async fn create_trash(
        &self,
        identity: &Identity,
        session: &SessionHandle,
        folders: &[FolderInfo],
        claims: &mut Claims,
    ) -> Result<MailboxId> {
        match session.create_folder(TRASH_PATH).await {
            Ok(()) => {
                let folder = FolderInfo {
                    path: TRASH_PATH.to_string(),
                    delimiter: folders.iter().find_map(|f| f.delimiter.clone()),
                    attributes: vec![SpecialUse::Trash.as_str().to_string()],
                    special_use: Some(SpecialUse::Trash),
                    selectable: true,
                };
                self.create(identity, session, &folder, claims).await
            }
            Err(e) => {
                let identity_id = identity
                    .id
                    .ok_or_else(|| Error::NotFound("unsaved identity".into()))?;
                warn!(%identity_id, error = %e, "could not create Trash remotely, using a local-only one");
                let mut mailbox = Mailbox {
                    id: None,
                    identity_id,
                    owner_id: identity.owner_id.clone(),
                    name: TRASH_PATH.to_string(),
                    slug: claims.slug("trash"),
                    kind: MailboxKind::Trash,
                    is_default: claims.default_for(MailboxKind::Trash),
                    remote_path: None,
                    delimiter: None,
                    remote_flags: Vec::new(),
                    special_use: None,
                    selectable: false,
                };
                self.mailboxes.insert(&mut mailbox).await?;
                mailbox
                    .id
                    .ok_or_else(|| Error::NotFound("inserted mailbox".into()))
            }
        }
    }

    /// Seeds a cursor from the folder's status, or a bootstrap cursor when the
    /// status cannot be read.
    async fn seed(
        &self,
        session: &SessionHandle,
        identity_id: IdentityId,
        mailbox_id: MailboxId,
        path: &str,
    ) -> Result<()> {
        let status = {
            let _folder = session.lock_folder(path).await;
            session.status(path).await
        };
        let cursor = match status {
            Ok(status) => SyncCursor::seeded(identity_id, mailbox_id, validity_of(&status), status.head_uid()),
            Err(e) => {
                warn!(%identity_id, %mailbox_id, path, error = %e, "folder status unavailable, cursor left in bootstrap");
                SyncCursor::bootstrap(identity_id, mailbox_id)
            }
        };
        self.mailboxes.seed_cursor(&cursor).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tidemail_imap::{FailPoint, MemoryServer, RecordedOp};

    use super::*;
    use crate::mailbox::SyncPhase;
    use crate::testing::{Fixture, raw_email};

    fn reconciler(fx: &Fixture, server: &MemoryServer) -> MailboxReconciler {
        MailboxReconciler::new(&fx.db, fx.connections(server))
    }

    async fn by_path(fx: &Fixture, path: &str) -> Mailbox {
        fx.mailboxes
            .find_by_path(fx.identity_id, path)
            .await
            .unwrap()
            .unwrap()
    }

    fn creates(server: &MemoryServer) -> usize {
        server
            .operations()
            .iter()
            .filter(|op| matches!(op, RecordedOp::Create { .. }))
            .count()
    }

    #[tokio::test]
    async fn first_pass_mirrors_folders_and_seeds_cursors() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Sent Items", Some(SpecialUse::Sent));
        server.add_folder("Projects/2024", None);
        for n in 0..3 {
            server
                .append("INBOX", &raw_email(&format!("<{n}@x>"), "hi", None), &[])
                .unwrap();
        }

        let report = reconciler(&fx, &server).reconcile(fx.identity_id).await.unwrap();

        assert_eq!(report.created.len(), 3);
        assert!(report.trash.is_some());
        assert_eq!(creates(&server), 1);

        let inbox = by_path(&fx, "INBOX").await;
        assert_eq!(inbox.kind, MailboxKind::Inbox);
        assert!(inbox.is_default);
        let cursor = fx
            .mailboxes
            .get_cursor(fx.identity_id, inbox.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.phase, SyncPhase::Backfill);
        assert_eq!(cursor.backfill_cursor_uid, 3);
        assert_eq!(cursor.uid_validity, server.uid_validity("INBOX"));

        let sent = by_path(&fx, "Sent Items").await;
        assert_eq!(sent.kind, MailboxKind::Sent);
        assert_eq!(sent.special_use.as_deref(), Some("\\Sent"));

        let custom = by_path(&fx, "Projects/2024").await;
        assert_eq!(custom.kind, MailboxKind::Custom);
        assert_eq!(custom.name, "2024");
        assert!(!custom.is_default);

        let trash = by_path(&fx, "Trash").await;
        assert_eq!(trash.kind, MailboxKind::Trash);
        assert!(trash.selectable);
    }

    #[tokio::test]
    async fn second_pass_leaves_cursors_alone() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Trash", Some(SpecialUse::Trash));
        let reconciler = reconciler(&fx, &server);
        reconciler.reconcile(fx.identity_id).await.unwrap();

        let inbox = by_path(&fx, "INBOX").await.id.unwrap();
        let mut cursor = fx.mailboxes.get_cursor(fx.identity_id, inbox).await.unwrap().unwrap();
        cursor.phase = SyncPhase::Idle;
        cursor.last_seen_uid = 99;
        fx.mailboxes.save_cursor(&cursor).await.unwrap();

        let report = reconciler.reconcile(fx.identity_id).await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(creates(&server), 0);
        assert_eq!(
            fx.mailboxes.get_cursor(fx.identity_id, inbox).await.unwrap().unwrap(),
            cursor
        );
    }

    #[tokio::test]
    async fn vanished_and_noselect_folders_are_tombstoned() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Trash", Some(SpecialUse::Trash));
        server.add_folder("Old", None);
        server.add_folder("Parent", None);
        let reconciler = reconciler(&fx, &server);
        reconciler.reconcile(fx.identity_id).await.unwrap();

        server.remove_folder("Old");
        server.set_selectable("Parent", false);
        let report = reconciler.reconcile(fx.identity_id).await.unwrap();

        assert_eq!(report.tombstoned, 2);
        assert!(!by_path(&fx, "Old").await.selectable);
        assert!(!by_path(&fx, "Parent").await.selectable);
        assert_eq!(fx.mailboxes.list(fx.identity_id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn refused_trash_falls_back_to_local_only() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.fail(FailPoint::Create);

        let report = reconciler(&fx, &server).reconcile(fx.identity_id).await.unwrap();

        let trash_id = report.trash.unwrap();
        let trash = fx.mailboxes.require(trash_id).await.unwrap();
        assert!(trash.is_local_only());
        assert!(!trash.selectable);
        assert_eq!(trash.kind, MailboxKind::Trash);
        assert!(fx.mailboxes.get_cursor(fx.identity_id, trash_id).await.unwrap().is_none());

        server.heal(FailPoint::Create);
        let again = reconciler(&fx, &server).reconcile(fx.identity_id).await.unwrap();
        assert!(again.trash.is_none());
    }

    #[tokio::test]
    async fn clashing_slugs_get_suffixes() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Trash", Some(SpecialUse::Trash));
        server.add_folder("Work", None);
        server.add_folder("work", None);

        reconciler(&fx, &server).reconcile(fx.identity_id).await.unwrap();

        assert_eq!(by_path(&fx, "Work").await.slug, "work");
        assert_eq!(by_path(&fx, "work").await.slug, "work-2");
    }

    #[tokio::test]
    async fn unreadable_status_leaves_bootstrap_cursor() {
        let fx = Fixture::new().await;
        let server = MemoryServer::new();
        server.add_folder("Trash", Some(SpecialUse::Trash));
        server.fail(FailPoint::Select);

        reconciler(&fx, &server).reconcile(fx.identity_id).await.unwrap();

        let inbox = by_path(&fx, "INBOX").await.id.unwrap();
        let cursor = fx.mailboxes.get_cursor(fx.identity_id, inbox).await.unwrap().unwrap();
        assert_eq!(cursor.phase, SyncPhase::Bootstrap);
    }
}
