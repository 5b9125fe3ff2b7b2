//! `tidemail` - mailbox sync worker.
//!
//! Commands:
//! - `tidemail [run]` runs the scheduler and a job worker until Ctrl-C
//! - `tidemail add-identity <owner> <email> <host> <username> [port]`
//!   registers an account; the password is read from `TIDEMAIL_PASSWORD`
//! - `tidemail status` prints the sync state of every mailbox

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tidemail_core::counter::SqliteCounterStore;
use tidemail_core::identity::{Identity, IdentityRepository};
use tidemail_core::jobs::{Engines, JobQueue, Scheduler, Worker};
use tidemail_core::mailbox::MailboxRepository;
use tidemail_core::search::{MemorySearchIndex, SearchIndex, TypesenseIndex};
use tidemail_core::session::ConnectionManager;
use tidemail_core::storage::{FsObjectStore, ObjectStore};
use tidemail_core::{Config, Database};
use tidemail_imap::{ImapConfig, ImapConnector, Security};

const PASSWORD_ENV: &str = "TIDEMAIL_PASSWORD";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidemail=info,tidemail_core=info,tidemail_imap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().await.context("loading configuration")?;
    let db = open_database(&config).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("run") => run(&config, &db).await,
        Some("add-identity") => add_identity(&db, &args[1..]).await,
        Some("status") => status(&db).await,
        Some(other) => bail!("unknown command {other:?}, expected run, add-identity or status"),
    }
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let path = config.database_path.to_string_lossy();
    Database::connect(&path)
        .await
        .with_context(|| format!("opening database {path}"))
}

async fn run(config: &Config, db: &Database) -> anyhow::Result<()> {
    info!(database = %config.database_path.display(), "starting tidemail worker");

    let storage: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.storage_root.clone()));
    let index: Arc<dyn SearchIndex> = if let Some(typesense) = TypesenseIndex::from_config(&config.search) {
        Arc::new(typesense)
    } else {
        warn!("no search url configured, indexing in process memory only");
        Arc::new(MemorySearchIndex::new())
    };
    let counters = Arc::new(SqliteCounterStore::new(db));
    let connections = ConnectionManager::new(ImapConnector::default(), config.session);

    let queue = JobQueue::new(db, config.jobs);
    let recovered = queue.recover().await.context("recovering interrupted jobs")?;
    if recovered > 0 {
        info!(recovered, "requeued jobs interrupted by the last shutdown");
    }

    let engines = Engines::new(db, config, connections.clone(), storage, index, counters);
    let worker = Worker::new(queue.clone(), engines, config.jobs.poll_interval());
    let scheduler = Scheduler::new(db, queue, config.scheduler);

    let (shutdown, signal) = watch::channel(false);
    let worker_task = tokio::spawn({
        let signal = signal.clone();
        async move { worker.run(signal).await }
    });
    let scheduler_task = tokio::spawn(async move { scheduler.run(signal).await });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    shutdown.send(true).ok();

    worker_task.await.context("worker task")?;
    scheduler_task.await.context("scheduler task")?;
    connections.close_all().await;
    Ok(())
}

async fn add_identity(db: &Database, args: &[String]) -> anyhow::Result<()> {
    let [owner, email, host, username, rest @ ..] = args else {
        bail!("usage: tidemail add-identity <owner> <email> <host> <username> [port]");
    };
    let password = std::env::var(PASSWORD_ENV).with_context(|| format!("{PASSWORD_ENV} is not set"))?;

    let mut imap = ImapConfig::new(host, Security::Tls).credentials(username, password);
    if let Some(port) = rest.first() {
        imap = imap.port(port.parse().with_context(|| format!("invalid port {port:?}"))?);
    }

    let mut identity = Identity::new(owner, email, imap);
    IdentityRepository::new(db).save(&mut identity).await?;
    if let Some(id) = identity.id {
        println!("identity {id} added for {email}");
    }
    Ok(())
}

async fn status(db: &Database) -> anyhow::Result<()> {
    let mailboxes = MailboxRepository::new(db);
    for identity in IdentityRepository::new(db).list().await? {
        let Some(identity_id) = identity.id else {
            continue;
        };
        println!("{} ({identity_id})", identity.email);
        for view in mailboxes.status(identity_id).await? {
            let phase = view.phase.map_or("-", |p| p.as_str());
            let synced = view
                .synced_at
                .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
            println!(
                "  {:<24} {:<8} {:<9} last_seen={:<8} backfill={:<8} synced={synced}{}",
                view.slug,
                view.kind.as_str(),
                phase,
                view.last_seen_uid,
                view.backfill_cursor_uid,
                if view.selectable { "" } else { " (unselectable)" },
            );
        }
    }
    Ok(())
}
