//! Rave CLI - read and write a shared rave store from the shell.
//!
//! Each invocation opens the location as a regular instance: it follows the
//! running leader if there is one and leads otherwise. `serve` keeps the
//! instance open until Ctrl-C so other processes can follow it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rave_core::{KeyRange, RaveDb, RaveEvent};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "rave")]
#[command(about = "Share one key-value store between local processes")]
struct Args {
    /// Store location
    #[arg(short, long, default_value = ".")]
    location: PathBuf,

    /// Rendezvous on this socket or pipe instead of the derived one
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Give up racing for leadership after this many milliseconds of contention
    #[arg(long, default_value = "10000")]
    retry_ceiling_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored under KEY
    Get { key: String },
    /// Store VALUE under KEY
    Put { key: String, value: String },
    /// Delete KEY
    Del { key: String },
    /// Print entries, optionally limited to a key prefix
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Print one JSON object per entry
        #[arg(long)]
        json: bool,
    },
    /// Print this instance's role and endpoint as JSON
    Status,
    /// Stay open until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for command output.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut builder = RaveDb::builder(&args.location)
        .retry_ceiling(Duration::from_millis(args.retry_ceiling_ms));
    if let Some(socket_path) = &args.socket_path {
        builder = builder.socket_path(socket_path);
    }

    let db = builder
        .open()
        .await
        .with_context(|| format!("Failed to open {}", args.location.display()))?;

    let outcome = run(&db, args.command).await;
    db.close().await?;
    outcome
}

async fn run(db: &RaveDb, command: Command) -> Result<()> {
    match command {
        Command::Get { key } => match db.get(key.as_str()).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => anyhow::bail!("Key not found: {}", key),
        },
        Command::Put { key, value } => db.put(key, value).await?,
        Command::Del { key } => db.del(key).await?,
        Command::List {
            prefix,
            reverse,
            limit,
            json,
        } => {
            let mut range = match prefix {
                Some(prefix) => KeyRange::prefix(prefix),
                None => KeyRange::all(),
            }
            .reverse(reverse);
            if let Some(limit) = limit {
                range = range.limit(limit);
            }

            let mut entries = db.iterator(range);
            while let Some((key, value)) = entries.next().await? {
                let key = String::from_utf8_lossy(&key);
                let value = String::from_utf8_lossy(&value);
                if json {
                    println!("{}", serde_json::json!({ "key": key, "value": value }));
                } else {
                    println!("{}\t{}", key, value);
                }
            }
        }
        Command::Status => {
            let status = serde_json::json!({
                "location": db.location(),
                "endpoint": db.endpoint().to_string(),
                "role": db.role(),
                "status": db.status(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Serve => serve(db).await?,
    }
    Ok(())
}

async fn serve(db: &RaveDb) -> Result<()> {
    info!(
        "Serving {} as {:?} on {}",
        db.location().display(),
        db.role(),
        db.endpoint()
    );

    let mut events = db.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(RaveEvent::Leader) => info!("Took over as leader"),
                Ok(RaveEvent::Follower) => info!("Following a new leader"),
                Ok(RaveEvent::Error(e)) => {
                    error!("Instance failed: {}", e);
                    anyhow::bail!("instance failed: {}", e);
                }
                Ok(RaveEvent::Closed) => return Ok(()),
                Err(e) => warn!("Missed instance events: {}", e),
            },
        }
    }
}
