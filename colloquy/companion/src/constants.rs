//! Constants and configuration values used throughout the Colloquy companion

use std::path::{Path, PathBuf};

/// Environment variable that overrides the discovery directory (used by
/// tests and sandboxed launches)
pub const DISCOVERY_DIR_ENV: &str = "COLLOQUY_DISCOVERY_DIR";

/// File name prefix for discovery records
pub const DISCOVERY_FILE_PREFIX: &str = "colloquy-ide-";

/// Records whose `updatedAt` is older than this are treated as stale by readers
pub const DISCOVERY_STALE_SECS: i64 = 3600;

/// How often a live server republishes its record so it never crosses the
/// staleness threshold
pub const DISCOVERY_REFRESH_SECS: u64 = 600;

/// Protocol version exchanged during the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "1.0";

/// The handshake must complete within this window or the connection is dropped
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Authentication failures tolerated on one connection before it is closed
pub const MAX_AUTH_FAILURES: u32 = 3;

/// How long a blocking `openDiff` waits for the user before giving up
pub const BLOCKING_RESOLUTION_TIMEOUT_SECS: u64 = 600;

/// Environment variables the launcher injects into the CLI
pub const ENV_SERVER_PORT: &str = "COLLOQUY_IDE_SERVER_PORT";
pub const ENV_AUTH_TOKEN: &str = "COLLOQUY_IDE_AUTH_TOKEN";
pub const ENV_WORKSPACE_ROOTS: &str = "COLLOQUY_IDE_WORKSPACE_ROOTS";
pub const ENV_SETTINGS_PATH: &str = "COLLOQUY_SYSTEM_SETTINGS_PATH";

/// Default log file name for development mode
pub const DEV_LOG_FILENAME: &str = "colloquy-companion.log";

/// Discovery directory: `$COLLOQUY_DISCOVERY_DIR` if set, otherwise
/// `$TMPDIR/colloquy/ide`
pub fn discovery_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DISCOVERY_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::temp_dir().join("colloquy").join("ide")
}

/// Development log file path
pub fn dev_log_path() -> PathBuf {
    std::env::temp_dir().join(DEV_LOG_FILENAME)
}

/// Sticky-port file for an editor process; lets a restarted server try to
/// reclaim the port its terminals already know
pub fn sticky_port_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("colloquy-port-{pid}"))
}
