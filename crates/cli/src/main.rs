//! Interactive REPL over a single-process, in-memory coordination core.
//!
//! Supplements the library surface with an operable entry point: start the
//! process, issue `create`/`get`/`set`/`delete`/`children`/`lock`/`unlock`
//! commands against one session, see the effect immediately. There's no
//! persistence across restarts and no networking — this is a demo harness,
//! not a server.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ensemble_core::{CancellationToken, Clock, CoordConfig, Path, SessionProvider, SystemClock, Timestamp};
use ensemble_coordination::{
    Cache, CoordinationManager, EphemeralSweeper, ExchangeManager, LocalTransport, LockManager,
    LockWaitDirectory, SessionManager, SessionOwner, WaitManager,
};
use ensemble_storage::{CasExpect, MemoryDatabase, StoredEntry, StoredSession};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Entries = MemoryDatabase<StoredEntry>;
type Sessions = MemoryDatabase<StoredSession>;
type Manager = CoordinationManager<Entries, Sessions, LocalTransport>;

#[derive(Parser, Debug)]
#[command(name = "ensemble-cli", about = "In-memory ensemble coordination REPL")]
struct Cli {
    /// Session lease length in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    lease_millis: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut config = CoordConfig::default();
    config.default_lease = Duration::from_millis(cli.lease_millis);

    let (manager, owner, _sweeper_handle) = build(config).await?;
    let session = owner.get_session().await.context("starting session")?;
    info!(session = %session, "session started");

    println!("ensemble-cli — session {session}");
    println!("commands: create <path> <value> [--ephemeral] | get <path> | set <path> <value> | delete <path> [--recursive] | children <path> | lock <path> | unlock <path> | quit");

    let mut editor = DefaultEditor::new().context("initializing line editor")?;
    loop {
        match editor.readline("ensemble> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed == "quit" || trimmed == "exit" {
                    break;
                }
                if let Err(err) = run_command(&manager, &session, trimmed).await {
                    println!("error: {err}");
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("readline error: {err}");
                break;
            }
        }
    }

    owner.close().await.context("closing session")?;
    Ok(())
}

async fn build(config: CoordConfig) -> Result<(Arc<Manager>, Arc<SessionOwner<Sessions>>, tokio::task::JoinHandle<()>)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let entries = Arc::new(MemoryDatabase::new());
    let sessions_db = Arc::new(MemoryDatabase::new());
    let sessions = Arc::new(SessionManager::new(sessions_db, clock.clone(), config.clone()));

    let cache = Arc::new(Cache::new());
    let wait_directory = Arc::new(LockWaitDirectory::new());
    let wait_manager = Arc::new(WaitManager::new(
        entries.clone(),
        sessions.clone(),
        wait_directory.clone(),
        config.clone(),
    ));
    let transport = Arc::new(LocalTransport::new());
    let exchange = Arc::new(ExchangeManager::new(transport, cache.clone(), wait_directory));
    let _receiver = exchange.clone().spawn_receiver();
    let locks = Arc::new(LockManager::new(
        entries.clone(),
        sessions.clone(),
        cache,
        wait_manager,
        exchange,
    ));

    entries
        .cas_update(
            StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
            CasExpect::Absent,
        )
        .await
        .context("seeding root entry")?;

    let manager = Arc::new(CoordinationManager::new(entries, sessions.clone(), locks, clock.clone()));

    let sweeper = Arc::new(EphemeralSweeper::new(
        manager.clone(),
        sessions.clone(),
        config.lease_poll_interval,
    ));
    let sweeper_handle = sweeper.spawn();

    let provider = Arc::new(SessionProvider::new(rand_seed()));
    let owner = Arc::new(SessionOwner::new(sessions, provider, clock, config));

    Ok((manager, owner, sweeper_handle))
}

fn rand_seed() -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

async fn run_command(manager: &Manager, session: &ensemble_core::SessionId, line: &str) -> Result<()> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let token = CancellationToken::new();

    match parts.as_slice() {
        ["create", path, value, rest @ ..] => {
            let ephemeral = rest.contains(&"--ephemeral");
            let entry = manager
                .create_entry(session, &parse_path(path), value.as_bytes().to_vec(), ephemeral, &token)
                .await?;
            println!("created {} (version {})", entry.path.escaped_form(), entry.storage_version);
        }
        ["get", path] => {
            let entry = manager.get_entry(&parse_path(path)).await?;
            println!("{}", String::from_utf8_lossy(&entry.value));
        }
        ["set", path, value] => {
            let entry = manager
                .set_value(session, &parse_path(path), value.as_bytes().to_vec(), &token)
                .await?;
            println!("set {} (version {})", entry.path.escaped_form(), entry.storage_version);
        }
        ["delete", path, rest @ ..] => {
            let recursive = rest.contains(&"--recursive");
            manager.delete_entry(session, &parse_path(path), recursive, &token).await?;
            println!("deleted {path}");
        }
        ["children", path] => {
            let children = manager.get_children(&parse_path(path)).await?;
            for child in children {
                println!("{}", child.as_str());
            }
        }
        ["lock", path] => {
            manager.acquire_write_lock(session, &parse_path(path), &token).await?;
            println!("locked {path}");
        }
        ["unlock", path] => {
            manager.release_write_lock(session, &parse_path(path)).await?;
            println!("unlocked {path}");
        }
        _ => return Err(anyhow!("unrecognized command: {line}")),
    }
    Ok(())
}

fn parse_path(raw: &str) -> Path {
    Path::from_escaped(raw)
}
