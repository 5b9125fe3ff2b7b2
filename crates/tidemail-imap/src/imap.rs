//! [`MailSession`] over a real IMAP server, backed by `async-imap`.

use std::future::Future;
use std::time::Duration;

use async_imap::types::{Fetch, Flag as ImapFlag, Name, NameAttribute};
use chrono::Utc;
use futures::TryStreamExt;
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::session::{Connector, MailSession};
use crate::stream::{self, ImapStream};
use crate::types::{
    FetchedMessage, Flag, FolderInfo, FolderStatus, SpecialUse, StoreAction, Uid, UidSet,
    UidValidity,
};
use crate::{Error, Result};

/// FETCH items requested for ingestion: everything needed to store the message.
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])";

/// Opens TLS IMAP sessions.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl ImapConnector {
    /// Creates a connector with the given timeouts.
    #[must_use]
    pub const fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(120))
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    async fn connect(&self, config: &ImapConfig) -> Result<ImapSession> {
        let stream = timed(self.connect_timeout, stream::open(config)).await?;

        let client = async_imap::Client::new(stream);
        let session = timed(self.connect_timeout, async {
            client
                .login(&config.username, &config.password)
                .await
                .map_err(|(e, _)| Error::Auth(e.to_string()))
        })
        .await?;

        info!(host = %config.host, user = %config.username, "IMAP session established");

        Ok(ImapSession {
            inner: session,
            command_timeout: self.command_timeout,
        })
    }
}

/// An authenticated IMAP session.
pub struct ImapSession {
    inner: async_imap::Session<ImapStream>,
    command_timeout: Duration,
}

impl MailSession for ImapSession {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let inner = &mut self.inner;
        let names: Vec<Name> = timed(self.command_timeout, async {
            let stream = inner.list(Some(""), Some("*")).await?;
            Ok(stream.try_collect().await?)
        })
        .await?;

        Ok(names.iter().map(folder_from_name).collect())
    }

    async fn select(&mut self, path: &str, read_only: bool) -> Result<FolderStatus> {
        let inner = &mut self.inner;
        let mailbox = timed(self.command_timeout, async {
            let mailbox = if read_only {
                inner.examine(path).await?
            } else {
                inner.select(path).await?
            };
            Ok(mailbox)
        })
        .await?;

        debug!(path, read_only, exists = mailbox.exists, "folder opened");

        Ok(FolderStatus {
            uid_validity: mailbox.uid_validity.and_then(UidValidity::new),
            uid_next: mailbox.uid_next.unwrap_or(1),
            exists: mailbox.exists,
        })
    }

    async fn uid_fetch(&mut self, uids: &UidSet) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let inner = &mut self.inner;
        let fetches: Vec<Fetch> = timed(self.command_timeout, async {
            let stream = inner.uid_fetch(uids.to_string(), FETCH_QUERY).await?;
            Ok(stream.try_collect().await?)
        })
        .await?;

        Ok(fetches.iter().filter_map(message_from_fetch).collect())
    }

    async fn uid_store(&mut self, uids: &UidSet, action: &StoreAction) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }

        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            let stream = inner.uid_store(uids.to_string(), action.to_query()).await?;
            let _: Vec<Fetch> = stream.try_collect().await?;
            Ok(())
        })
        .await
    }

    async fn uid_move(&mut self, uids: &UidSet, dest: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }

        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            inner.uid_mv(uids.to_string(), dest).await?;
            Ok(())
        })
        .await
    }

    async fn uid_delete(&mut self, uids: &UidSet) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }

        self.uid_store(uids, &StoreAction::Add(vec![Flag::Deleted]))
            .await?;

        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            let stream = inner.uid_expunge(uids.to_string()).await?;
            let _: Vec<u32> = stream.try_collect().await?;
            Ok(())
        })
        .await
    }

    async fn uid_search_all(&mut self) -> Result<Vec<Uid>> {
        let inner = &mut self.inner;
        let found = timed(self.command_timeout, async {
            Ok(inner.uid_search("ALL").await?)
        })
        .await?;

        let mut uids: Vec<Uid> = found.into_iter().filter_map(Uid::new).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn create_folder(&mut self, path: &str) -> Result<()> {
        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            inner.create(path).await?;
            Ok(())
        })
        .await
    }

    async fn noop(&mut self) -> Result<()> {
        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            inner.noop().await?;
            Ok(())
        })
        .await
    }

    async fn logout(&mut self) -> Result<()> {
        let inner = &mut self.inner;
        timed(self.command_timeout, async {
            inner.logout().await?;
            Ok(())
        })
        .await
    }
}

/// Runs a protocol future under a deadline.
async fn timed<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))?
}

fn folder_from_name(name: &Name) -> FolderInfo {
    let attributes: Vec<String> = name.attributes().iter().map(attribute_str).collect();
    let selectable = !name
        .attributes()
        .iter()
        .any(|a| matches!(a, NameAttribute::NoSelect));
    let special_use = attributes.iter().find_map(|a| SpecialUse::parse(a));

    FolderInfo {
        path: name.name().to_string(),
        delimiter: name.delimiter().map(str::to_string),
        attributes,
        special_use,
        selectable,
    }
}

fn attribute_str(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::All => "\\All".to_string(),
        NameAttribute::Archive => "\\Archive".to_string(),
        NameAttribute::Drafts => "\\Drafts".to_string(),
        NameAttribute::Flagged => "\\Flagged".to_string(),
        NameAttribute::Junk => "\\Junk".to_string(),
        NameAttribute::Sent => "\\Sent".to_string(),
        NameAttribute::Trash => "\\Trash".to_string(),
        NameAttribute::Extension(label) => label.to_string(),
        other => format!("{other:?}"),
    }
}

fn message_from_fetch(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid.and_then(Uid::new)?;
    let flags = fetch
        .flags()
        .filter_map(|flag| match flag {
            ImapFlag::Seen => Some(Flag::Seen),
            ImapFlag::Answered => Some(Flag::Answered),
            ImapFlag::Flagged => Some(Flag::Flagged),
            ImapFlag::Deleted => Some(Flag::Deleted),
            ImapFlag::Draft => Some(Flag::Draft),
            ImapFlag::Custom(keyword) => Some(Flag::Keyword(keyword.to_string())),
            _ => None,
        })
        .collect();

    Some(FetchedMessage {
        uid,
        flags,
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        size: fetch.size.unwrap_or(0),
        raw: fetch.body().map(<[u8]>::to_vec).unwrap_or_default(),
    })
}
