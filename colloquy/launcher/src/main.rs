//! Connection resolver: invoked by a terminal immediately before the CLI
//!
//! Re-reads the discovery store at invocation time — inherited environment
//! is never trusted, so a server restart between two launches is picked up
//! automatically. Injects fresh connection parameters and the
//! pre-authorization grant, then hands off execution. With no valid record
//! the CLI runs unmodified; a missing companion is never a launch failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use colloquy_companion::auth::AuthorizationGrant;
use colloquy_companion::constants;
use colloquy_companion::discovery::{DiscoveryRecord, DiscoveryStore};

#[derive(Parser, Debug)]
#[command(name = "colloquy-launch")]
#[command(about = "Launch a CLI assistant against the freshest companion server")]
struct Args {
    /// Settings file overriding the configured CLI path and environment
    #[arg(long)]
    settings: Option<PathBuf>,

    /// The CLI command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Read-only launcher configuration: the configured CLI executable and
/// extra environment, consumed but never written here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LauncherSettings {
    cli_path: Option<String>,
    environment: HashMap<String, String>,
}

fn main() -> Result<()> {
    // Quiet unless RUST_LOG asks otherwise; the CLI owns the terminal.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = load_settings(args.settings);

    let mut command = args.command;
    if command.is_empty() {
        match settings.cli_path.clone() {
            Some(cli) => command.push(cli),
            None => bail!("no command given and no cliPath configured"),
        }
    }

    let mut env: Vec<(String, String)> = settings.environment.into_iter().collect();

    // Fresh read, every invocation. Cached ports and tokens from a previous
    // launch are exactly the failure mode this executable exists to avoid.
    let store = DiscoveryStore::from_env();
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    match store.select_for(&cwd) {
        Some(record) if port_reachable(record.port) => {
            info!(
                "connecting CLI to companion instance {} on port {}",
                record.instance_id, record.port
            );
            env.push((constants::ENV_SERVER_PORT.into(), record.port.to_string()));
            env.push((constants::ENV_AUTH_TOKEN.into(), record.token.clone()));
            if let Ok(joined) = std::env::join_paths(&record.workspace_roots) {
                env.push((
                    constants::ENV_WORKSPACE_ROOTS.into(),
                    joined.to_string_lossy().to_string(),
                ));
            }
            if let Some(grant_path) = write_grant(&record) {
                env.push((
                    constants::ENV_SETTINGS_PATH.into(),
                    grant_path.display().to_string(),
                ));
            }
        }
        Some(record) => {
            // Lazy reaping: a record whose port refuses connections is dead
            // weight until its editor republishes or the store filters it.
            info!(
                "companion record {} port {} unreachable; launching without IDE features",
                record.instance_id, record.port
            );
        }
        None => {
            info!("no companion server discovered; launching without IDE features");
        }
    }

    exec(command, env)
}

fn load_settings(path: Option<PathBuf>) -> LauncherSettings {
    let path = path.or_else(default_settings_path);
    let Some(path) = path else {
        return LauncherSettings::default();
    };
    let Ok(text) = std::fs::read_to_string(&path) else {
        return LauncherSettings::default();
    };
    match serde_json::from_str(&text) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("ignoring malformed settings file {}: {e}", path.display());
            LauncherSettings::default()
        }
    }
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("colloquy").join("settings.json"))
}

fn port_reachable(port: u16) -> bool {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_ok()
}

/// Grant artifact consumed by the CLI's own consent layer. Regenerated on
/// every launch so it always matches the current token; best effort, since
/// the CLI degrades to interactive consent without it.
fn write_grant(record: &DiscoveryRecord) -> Option<PathBuf> {
    let grant = AuthorizationGrant::new(record.instance_id);
    let value = grant.to_settings_value(record);

    let dir = std::env::temp_dir().join("colloquy").join("settings");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("failed to create grant directory: {e}");
        return None;
    }
    let path = dir.join(format!("colloquy-grant-{}.json", std::process::id()));
    match serde_json::to_string(&value) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!("failed to write grant artifact: {e}");
                return None;
            }
            Some(path)
        }
        Err(e) => {
            warn!("failed to serialize grant artifact: {e}");
            None
        }
    }
}

fn exec(command: Vec<String>, env: Vec<(String, String)>) -> Result<()> {
    let (program, rest) = command
        .split_first()
        .context("no command to launch")?;
    // Resolve through PATH up front for a clearer error; fall back to the
    // raw name and let the OS report it.
    let program_path = which::which(program).unwrap_or_else(|_| PathBuf::from(program));

    let mut cmd = std::process::Command::new(program_path);
    cmd.args(rest);
    for (key, value) in env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = cmd.exec();
        Err(anyhow::Error::from(err).context(format!("failed to exec {program}")))
    }

    #[cfg(not(unix))]
    {
        let status = cmd
            .status()
            .with_context(|| format!("failed to launch {program}"))?;
        std::process::exit(status.code().unwrap_or(0));
    }
}
