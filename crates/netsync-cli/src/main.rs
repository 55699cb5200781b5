//! netsync: edit a replicated network from the command line.
//!
//! Each invocation pulls from the remote replica, applies one command to the
//! network's graph, writes the result locally and pushes it back.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netsync_cli::{Session, SessionOptions};
use netsync_core::{Fields, Position, Secret, SyncConfig};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "netsync")]
#[command(about = "Replicated network documents")]
struct Args {
    /// Directory holding the local replica
    #[arg(long, default_value = ".netsync/local")]
    data_dir: PathBuf,

    /// Directory holding the remote replica
    #[arg(long, default_value = ".netsync/remote")]
    remote_dir: PathBuf,

    /// Network (collection and document) id
    #[arg(short, long, default_value = "default")]
    network: String,

    /// Write secret for the network
    #[arg(long, env = "NETSYNC_SECRET", default_value = "")]
    secret: String,

    /// YAML sync configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the network if it does not exist
    Init,
    /// Print the network as JSON
    Show,
    /// Add a node
    AddNode {
        id: String,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
    },
    /// Add an edge between two nodes
    AddEdge {
        id: String,
        source: String,
        target: String,
    },
    /// Set a data field on an element (or on the network, by its id)
    Set {
        id: String,
        key: String,
        /// JSON value; anything that does not parse is taken as a string
        value: String,
    },
    /// Move a node
    Move { id: String, x: f64, y: f64 },
    /// Remove an element (a node takes its edges with it)
    Remove { id: String },
    /// Replicate without editing
    Sync,
    /// Manage snapshots on the remote replica
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    Create,
    List,
    Restore { snapshot_id: String },
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run(session: &Session, command: Command) -> Result<()> {
    match command {
        Command::Init | Command::Sync => {}
        Command::Show => {
            println!("{}", serde_json::to_string_pretty(&session.show())?);
            return Ok(());
        }
        Command::AddNode { id, label, x, y } => {
            let mut data = Fields::new();
            if !label.is_empty() {
                data.insert("label".into(), Value::String(label));
            }
            session.add_node(&id, data, Position { x, y })?;
        }
        Command::AddEdge { id, source, target } => {
            session.add_edge(&id, &source, &target, Fields::new())?;
        }
        Command::Set { id, key, value } => session.set(&id, &key, parse_value(&value))?,
        Command::Move { id, x, y } => session.move_to(&id, Position { x, y })?,
        Command::Remove { id } => session.remove(&id)?,
        Command::Snapshot(SnapshotCommand::Create) => {
            let snapshots = session.snapshots();
            snapshots.install_design_doc().await?;
            let summary = snapshots.create(session.network().id()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            return Ok(());
        }
        Command::Snapshot(SnapshotCommand::List) => {
            let list = session.snapshots().list(session.network().id()).await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
            return Ok(());
        }
        Command::Snapshot(SnapshotCommand::Restore { snapshot_id }) => {
            session
                .snapshots()
                .restore(session.network().id(), &snapshot_id)
                .await?;
        }
    }

    let report = session.commit().await?;
    info!(
        "Replicated: pulled {}, pushed {}, {} remote change(s)",
        report.pulled, report.pushed, report.changed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,netsync=debug,netsync_cli=debug,netsync_core=debug"
    } else {
        "info,netsync=info,netsync_cli=info,netsync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let session = Session::open(SessionOptions {
        data_dir: args.data_dir,
        remote_dir: args.remote_dir,
        network: args.network,
        secret: Secret::new(args.secret),
        config,
    })
    .await?;

    let result = run(&session, args.command).await;
    session.close();
    result
}
