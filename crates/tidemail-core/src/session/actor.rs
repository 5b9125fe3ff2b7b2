//! The task that owns one identity's protocol session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior, error::Elapsed};
use tracing::{debug, info, warn};

use tidemail_imap::{
    Connector, FetchedMessage, FolderInfo, FolderStatus, ImapConfig, MailSession, StoreAction,
    Uid, UidSet,
};

use super::command::SessionCommand;
use crate::config::SessionConfig;
use crate::identity::IdentityId;
use crate::{Error, Result};

struct Selected {
    path: String,
    writable: bool,
}

pub(super) struct SessionActor<C: Connector> {
    connector: Arc<C>,
    identity_id: IdentityId,
    imap: ImapConfig,
    config: SessionConfig,
    session: Option<C::Session>,
    selected: Option<Selected>,
}

impl<C: Connector> SessionActor<C> {
    pub(super) fn new(
        connector: Arc<C>,
        identity_id: IdentityId,
        imap: ImapConfig,
        config: SessionConfig,
    ) -> Self {
        Self {
            connector,
            identity_id,
            imap,
            config,
            session: None,
            selected: None,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let period = self.config.keepalive().max(Duration::from_secs(1));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown { reply }) => {
                            self.disconnect().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => {
                            self.handle(command).await;
                            keepalive.reset();
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => self.keepalive().await,
            }
        }

        self.disconnect().await;
        debug!(identity_id = %self.identity_id, "session actor stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        // A dropped reply receiver only means the caller gave up waiting.
        match command {
            SessionCommand::ListFolders { reply } => {
                let _ = reply.send(self.list_folders().await);
            }
            SessionCommand::Status { path, reply } => {
                let _ = reply.send(self.select(&path, true).await);
            }
            SessionCommand::Fetch { path, uids, reply } => {
                let _ = reply.send(self.fetch(&path, &uids).await);
            }
            SessionCommand::Store {
                path,
                uids,
                action,
                reply,
            } => {
                let _ = reply.send(self.store(&path, &uids, &action).await);
            }
            SessionCommand::Move {
                path,
                uids,
                dest,
                reply,
            } => {
                let _ = reply.send(self.move_to(&path, &uids, &dest).await);
            }
            SessionCommand::Delete { path, uids, reply } => {
                let _ = reply.send(self.delete(&path, &uids).await);
            }
            SessionCommand::SearchAll { path, reply } => {
                let _ = reply.send(self.search_all(&path).await);
            }
            SessionCommand::CreateFolder { path, reply } => {
                let _ = reply.send(self.create_folder(&path).await);
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn connect(&mut self) -> Result<C::Session> {
        let attempts = self.config.max_reconnect_attempts.max(1);
        let timeout = self.config.command_timeout();
        let mut delay = self.config.reconnect_delay();
        let mut attempt = 1;

        loop {
            let error = match time::timeout(timeout, self.connector.connect(&self.imap)).await {
                Ok(Ok(session)) => {
                    info!(identity_id = %self.identity_id, attempt, "session connected");
                    return Ok(session);
                }
                Ok(Err(e)) => e,
                Err(_) => tidemail_imap::Error::Timeout(timeout),
            };

            if attempt >= attempts {
                warn!(identity_id = %self.identity_id, attempt, error = %error, "giving up on connect");
                return Err(error.into());
            }

            warn!(
                identity_id = %self.identity_id,
                attempt,
                retry_in = ?delay,
                error = %error,
                "connect failed, retrying"
            );
            time::sleep(delay).await;
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    async fn connected(&mut self) -> Result<&mut C::Session> {
        if self.session.is_none() {
            let session = self.connect().await?;
            self.session = Some(session);
            self.selected = None;
        }
        self.session
            .as_mut()
            .ok_or_else(|| Error::SessionClosed(format!("identity {}", self.identity_id)))
    }

    /// Unwraps a command outcome, dropping the connection on transport failures.
    fn settle<T>(
        &mut self,
        outcome: std::result::Result<tidemail_imap::Result<T>, Elapsed>,
    ) -> Result<T> {
        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => tidemail_imap::Error::Timeout(self.config.command_timeout()),
        };

        if error.is_fatal() {
            warn!(identity_id = %self.identity_id, error = %error, "dropping session");
            self.session = None;
            self.selected = None;
        }
        Err(error.into())
    }

    async fn select(&mut self, path: &str, read_only: bool) -> Result<FolderStatus> {
        let timeout = self.config.command_timeout();
        self.selected = None;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.select(path, read_only)).await;
        let status = self.settle(outcome)?;
        self.selected = Some(Selected {
            path: path.to_string(),
            writable: !read_only,
        });
        Ok(status)
    }

    async fn ensure_selected(&mut self, path: &str, writable: bool) -> Result<()> {
        let reusable = self
            .selected
            .as_ref()
            .is_some_and(|s| s.path == path && (s.writable || !writable));
        if reusable && self.session.is_some() {
            return Ok(());
        }
        self.select(path, !writable).await.map(|_| ())
    }

    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let timeout = self.config.command_timeout();
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.list_folders()).await;
        self.settle(outcome)
    }

    async fn fetch(&mut self, path: &str, uids: &UidSet) -> Result<Vec<FetchedMessage>> {
        let timeout = self.config.command_timeout();
        self.ensure_selected(path, false).await?;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.uid_fetch(uids)).await;
        self.settle(outcome)
    }

    async fn store(&mut self, path: &str, uids: &UidSet, action: &StoreAction) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.ensure_selected(path, true).await?;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.uid_store(uids, action)).await;
        self.settle(outcome)
    }

    async fn move_to(&mut self, path: &str, uids: &UidSet, dest: &str) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.ensure_selected(path, true).await?;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.uid_move(uids, dest)).await;
        self.settle(outcome)
    }

    async fn delete(&mut self, path: &str, uids: &UidSet) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.ensure_selected(path, true).await?;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.uid_delete(uids)).await;
        self.settle(outcome)
    }

    async fn search_all(&mut self, path: &str) -> Result<Vec<Uid>> {
        let timeout = self.config.command_timeout();
        self.ensure_selected(path, false).await?;
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.uid_search_all()).await;
        self.settle(outcome)
    }

    async fn create_folder(&mut self, path: &str) -> Result<()> {
        let timeout = self.config.command_timeout();
        let session = self.connected().await?;
        let outcome = time::timeout(timeout, session.create_folder(path)).await;
        self.settle(outcome)
    }

    async fn keepalive(&mut self) {
        let timeout = self.config.command_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let outcome = time::timeout(timeout, session.noop()).await;
        if let Err(e) = self.settle(outcome) {
            debug!(identity_id = %self.identity_id, error = %e, "keepalive failed");
        }
    }

    async fn disconnect(&mut self) {
        self.selected = None;
        if let Some(mut session) = self.session.take() {
            let timeout = self.config.command_timeout();
            if let Ok(Err(e)) = time::timeout(timeout, session.logout()).await {
                debug!(identity_id = %self.identity_id, error = %e, "logout failed");
            }
        }
    }
}
