//! clanchat store inspector.
//!
//! Usage:
//!   clanchat shard <user-id>
//!   clanchat cache list
//!   clanchat cache show <conversation> [--json]
//!   clanchat cache prune | clear [conversation]
//!   clanchat outbox list [--conversation <id>] | prune | clear
//!   clanchat info
//!
//! The database defaults to the path in the client config
//! (`~/.config/clanchat/client.ron`), or the platform data dir.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clanchat_client::ClientConfig;
use clanchat_store::{MessageStore, SqliteKv};
use clanchat_types::{ConversationId, shard_for, shard_index};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "clanchat")]
#[command(about = "Inspect and maintain the clanchat local message store")]
struct Args {
    /// Client config file (RON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the global chat shard for a user id
    Shard { user_id: String },
    /// Message cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Pending outbound messages
    #[command(subcommand)]
    Outbox(OutboxCommand),
    /// Entry counts and database location
    Info,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    List,
    Show {
        conversation: String,
        /// Print the raw cache record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete entries older than the expiry window
    Prune,
    /// Drop one conversation, or everything when none is given
    Clear { conversation: Option<String> },
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
    List {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Delete entries that used up their retries
    Prune,
    Clear,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();

    if let Command::Shard { user_id } = &args.command {
        println!("{} (index {})", shard_for(Some(user_id.as_str())), shard_index(user_id));
        return Ok(());
    }

    let config = ClientConfig::load_or_default(args.config.as_deref()).context("loading client config")?;
    let db_path = args.db.clone().unwrap_or_else(|| config.database_path());
    let kv = SqliteKv::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    let store = MessageStore::new(kv, config.store.clone());
    tracing::debug!(path = %db_path.display(), "opened store");

    match args.command {
        Command::Shard { .. } => {}
        Command::Cache(cmd) => run_cache(&store, cmd)?,
        Command::Outbox(cmd) => run_outbox(&store, cmd),
        Command::Info => {
            let info = store.storage_info();
            println!("database:  {}", db_path.display());
            println!("cached:    {} conversations", info.cache_entries);
            println!("outbox:    {} messages", info.outbox_entries);
        }
    }
    Ok(())
}

fn run_cache(store: &MessageStore, cmd: CacheCommand) -> Result<()> {
    match cmd {
        CacheCommand::List => {
            for id in store.cached_conversations() {
                match store.peek_cached(&id) {
                    Some(cached) => {
                        let stale = if store.is_cache_expired(&cached) { " (expired)" } else { "" };
                        println!(
                            "{id}\t{} messages\tupdated {}{stale}",
                            cached.messages.len(),
                            format_millis(cached.last_updated)
                        );
                    }
                    None => println!("{id}\t(unreadable)"),
                }
            }
        }
        CacheCommand::Show { conversation, json } => {
            let id = ConversationId::from(conversation);
            let Some(cached) = store.peek_cached(&id) else {
                anyhow::bail!("no cache entry for {id}");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&cached)?);
            } else {
                for m in &cached.messages {
                    println!("{}  {:<16} {}", m.timestamp, m.sender_id, m.content);
                }
            }
        }
        CacheCommand::Prune => {
            let pruned = store.prune_expired_cache_entries();
            println!("pruned {pruned} cache entries");
        }
        CacheCommand::Clear { conversation: Some(conversation) } => {
            store.clear_conversation(&ConversationId::from(conversation));
        }
        CacheCommand::Clear { conversation: None } => store.clear_all_cache(),
    }
    Ok(())
}

fn run_outbox(store: &MessageStore, cmd: OutboxCommand) {
    match cmd {
        OutboxCommand::List { conversation } => {
            let filter = conversation.map(ConversationId::from);
            for entry in store.get_outbox_messages(filter.as_ref()) {
                let exhausted = if store.is_exhausted(&entry) { " (exhausted)" } else { "" };
                println!(
                    "{}\tretries {}\tlast {}{exhausted}\t{}",
                    entry.outbox_id,
                    entry.retry_count,
                    format_millis(entry.last_attempt),
                    entry.message.content
                );
            }
        }
        OutboxCommand::Prune => {
            let pruned = store.prune_exhausted_outbox_entries();
            println!("pruned {pruned} outbox entries");
        }
        OutboxCommand::Clear => store.clear_outbox(),
    }
}

fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| millis.to_string())
}
