//! One long-lived protocol session per identity.
//!
//! Each identity's session is owned by a single actor task; engines talk to
//! it through a cloneable [`SessionHandle`]. The actor reconnects on demand
//! after a transport failure and sends NOOP while idle.

mod actor;
mod command;
mod handle;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use tidemail_imap::{Connector, ImapConfig};

pub use handle::SessionHandle;

use self::actor::SessionActor;
use crate::config::SessionConfig;
use crate::identity::{Identity, IdentityId};
use crate::{Error, Result};

/// Commands queued per session before callers wait for capacity.
const COMMAND_BUFFER: usize = 32;

type SpawnFn = dyn Fn(IdentityId, ImapConfig) -> SessionHandle + Send + Sync;

/// Registry of session actors keyed by identity.
#[derive(Clone)]
pub struct ConnectionManager {
    spawn: Arc<SpawnFn>,
    sessions: Arc<Mutex<HashMap<IdentityId, SessionHandle>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("sessions", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager whose actors open sessions through `connector`.
    #[must_use]
    pub fn new<C: Connector>(connector: C, config: SessionConfig) -> Self {
        let connector = Arc::new(connector);
        let spawn = move |identity_id: IdentityId, imap: ImapConfig| {
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
            let actor = SessionActor::new(Arc::clone(&connector), identity_id, imap, config);
            tokio::spawn(actor.run(rx));
            SessionHandle::new(identity_id, tx)
        };

        Self {
            spawn: Arc::new(spawn),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IdentityId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the identity's session, starting its actor if needed.
    ///
    /// The actor connects lazily on the first command.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity has not been saved.
    pub fn session(&self, identity: &Identity) -> Result<SessionHandle> {
        let identity_id = identity
            .id
            .ok_or_else(|| Error::NotFound("unsaved identity".into()))?;

        let mut sessions = self.lock();
        if let Some(handle) = sessions.get(&identity_id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }

        debug!(%identity_id, "starting session actor");
        let handle = (self.spawn)(identity_id, identity.imap.clone());
        sessions.insert(identity_id, handle.clone());
        Ok(handle)
    }

    /// Stops the identity's session, if any.
    pub async fn close(&self, identity_id: IdentityId) {
        let handle = self.lock().remove(&identity_id);
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Stops every session.
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
