//! Colloquy Companion binary
//!
//! Hosts the RPC server an editor process would embed, with a small stdin
//! console standing in for the editor's accept/reject controls.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};

use colloquy_companion::{
    CompanionServer, DiffRegistryHandle, DiscoveryStore, EditorHandle, Options, WorkspaceEditor,
    logging, tools,
};

#[derive(Parser)]
#[command(name = "colloquy-companion")]
#[command(about = "Editor companion service for terminal AI assistants")]
struct Args {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run the companion server
    Serve {
        /// Workspace roots the server arbitrates; defaults to the current directory
        #[arg(long = "root")]
        roots: Vec<PathBuf>,
    },

    /// Debug companion state
    #[command(subcommand)]
    Debug(DebugCommand),
}

#[derive(Parser, Debug)]
enum DebugCommand {
    /// List the discovery records a launcher would see right now
    ListServers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let flush_guard =
        logging::init_tracing(args.options.dev_log).expect("Failed to initialize logging");

    match args.command {
        Some(Command::Debug(DebugCommand::ListServers)) => list_servers(),
        Some(Command::Serve { roots }) => serve(roots).await?,
        None => serve(Vec::new()).await?,
    }

    std::mem::drop(flush_guard);
    Ok(())
}

async fn serve(mut roots: Vec<PathBuf>) -> Result<()> {
    if roots.is_empty() {
        roots.push(std::env::current_dir()?);
    }
    let roots: Vec<PathBuf> = roots
        .into_iter()
        .map(|root| root.canonicalize().unwrap_or(root))
        .collect();
    info!("starting companion server for roots {roots:?}");

    let store = DiscoveryStore::from_env();
    let editor = WorkspaceEditor::new();
    let server = CompanionServer::bind(store, EditorHandle::new(editor), roots).await?;

    println!(
        "listening on 127.0.0.1:{} (instance {})",
        server.port(),
        server.instance().instance_id
    );

    let registry = server.registry().clone();
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        _ = resolution_console(registry) => {
            info!("console closed, shutting down");
        }
    }

    // Deregister before the listener is dropped.
    server.shutdown();
    Ok(())
}

/// Stand-in for the editor's accept/reject controls: `accept <path>` or
/// `reject <path>` per line on stdin.
async fn resolution_console(registry: DiffRegistryHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.trim().splitn(2, ' ');
        let verb = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");

        let accepted = match verb {
            "accept" => true,
            "reject" => false,
            "" => continue,
            _ => {
                eprintln!("expected: accept <path> | reject <path>");
                continue;
            }
        };
        if path.is_empty() {
            eprintln!("expected a file path");
            continue;
        }

        let path = tools::normalize_path(std::path::Path::new(path));
        match registry.resolve(path.clone(), accepted).await {
            Ok(_) => println!("{verb}ed {}", path.display()),
            Err(e) => eprintln!("{e}"),
        }
    }
}

fn list_servers() {
    let store = DiscoveryStore::from_env();
    let records = store.list();
    if records.is_empty() {
        println!("No companion servers discovered.");
        return;
    }
    for record in records {
        println!(
            "  {} port {} pid {} updated {} roots {:?}",
            record.instance_id, record.port, record.pid, record.updated_at, record.workspace_roots
        );
    }
}
