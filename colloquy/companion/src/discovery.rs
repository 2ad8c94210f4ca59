//! Durable discovery records: how an independently launched CLI finds a
//! running companion server and the token to present
//!
//! One JSON file per server instance in a well-known temp location. Writes
//! go through a temp-file-then-rename so a concurrent reader never observes
//! a half-written record. The editor side is the only writer; launchers and
//! test clients are readers, so no cross-process locking is needed beyond
//! the atomic publish.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthToken;
use crate::constants;

/// One running companion server inside an editor process. Exactly one is
/// discoverable per editor process; a new bind overwrites the prior record.
#[derive(Debug, Clone)]
pub struct ServerInstance {
    pub instance_id: Uuid,
    pub port: u16,
    pub token: AuthToken,
    pub pid: u32,
    pub workspace_roots: Vec<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl ServerInstance {
    pub fn new(port: u16, token: AuthToken, workspace_roots: Vec<PathBuf>) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            port,
            token,
            pid: std::process::id(),
            workspace_roots,
            created_at: Utc::now(),
        }
    }
}

/// Externally visible projection of a [`ServerInstance`], flat JSON so a
/// minimal independent client can parse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub port: u16,
    pub token: String,
    pub instance_id: Uuid,
    pub workspace_roots: Vec<PathBuf>,
    pub pid: u32,
    /// Milliseconds since the epoch; bumped on every republish.
    pub updated_at: i64,
}

impl DiscoveryRecord {
    fn from_instance(instance: &ServerInstance) -> Self {
        Self {
            port: instance.port,
            token: instance.token.as_str().to_string(),
            instance_id: instance.instance_id,
            workspace_roots: instance.workspace_roots.clone(),
            pid: instance.pid,
            updated_at: Utc::now().timestamp_millis(),
        }
    }

    /// Readers must not trust a record past the staleness threshold; a live
    /// server republishes well inside it.
    pub fn is_stale(&self) -> bool {
        let age_ms = Utc::now().timestamp_millis() - self.updated_at;
        age_ms > constants::DISCOVERY_STALE_SECS * 1000
    }

    /// Whether any advertised workspace root contains `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.workspace_roots.iter().any(|root| path.starts_with(root))
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery directory {} is not writable: {source}", .dir.display())]
    Unwritable {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize discovery record: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Read/write/invalidate access to the discovery directory. Pure state; the
/// staleness and reachability judgments belong to the readers.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    dir: PathBuf,
}

impl DiscoveryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the well-known discovery directory.
    pub fn from_env() -> Self {
        Self::new(constants::discovery_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, instance_id: Uuid) -> PathBuf {
        self.dir.join(format!(
            "{}{}.json",
            constants::DISCOVERY_FILE_PREFIX,
            instance_id.simple()
        ))
    }

    /// Publish the record atomically: a reader sees either the old record or
    /// the new one, never a partial write. An unwritable directory is
    /// reported up and is fatal to server startup.
    pub fn publish(&self, instance: &ServerInstance) -> Result<DiscoveryRecord> {
        std::fs::create_dir_all(&self.dir).map_err(|source| DiscoveryError::Unwritable {
            dir: self.dir.clone(),
            source,
        })?;

        let record = DiscoveryRecord::from_instance(instance);
        let bytes = serde_json::to_vec(&record)?;

        let final_path = self.record_path(instance.instance_id);
        let tmp_path = final_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|source| DiscoveryError::Unwritable {
            dir: self.dir.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &final_path).map_err(|source| DiscoveryError::Unwritable {
            dir: self.dir.clone(),
            source,
        })?;

        debug!("published discovery record at {}", final_path.display());
        Ok(record)
    }

    /// Republish to bump `updatedAt`.
    pub fn refresh(&self, instance: &ServerInstance) -> Result<DiscoveryRecord> {
        self.publish(instance)
    }

    /// Remove every record this editor process published before. A new bind
    /// overwrites the prior record rather than accumulating beside it.
    pub fn invalidate_pid(&self, pid: u32) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(constants::DISCOVERY_FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            if let Ok(record) = serde_json::from_str::<DiscoveryRecord>(&text) {
                if record.pid == pid {
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("failed to remove stale record {name}: {e}");
                    }
                }
            }
        }
    }

    /// Remove the record; an absent file means it was already reaped.
    pub fn invalidate(&self, instance_id: Uuid) {
        let path = self.record_path(instance_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove discovery record {}: {e}", path.display());
            }
        }
    }

    /// Fresh directory scan on every call. Corrupt records are skipped with
    /// a warning ("no server available", never a crash) and records whose
    /// backing process is gone are filtered out.
    pub fn list(&self) -> Vec<DiscoveryRecord> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(constants::DISCOVERY_FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }

            let text = match std::fs::read_to_string(entry.path()) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to read discovery record {name}: {e}");
                    continue;
                }
            };
            match serde_json::from_str::<DiscoveryRecord>(&text) {
                Ok(record) => {
                    if process_alive(record.pid) {
                        records.push(record);
                    } else {
                        debug!("skipping discovery record for dead pid {}", record.pid);
                    }
                }
                Err(e) => warn!("skipping corrupt discovery record {name}: {e}"),
            }
        }
        records
    }

    /// Pick the freshest valid record for work under `dir`: workspace-root
    /// containment first, falling back to most-recently-updated.
    pub fn select_for(&self, dir: &Path) -> Option<DiscoveryRecord> {
        let mut candidates: Vec<DiscoveryRecord> =
            self.list().into_iter().filter(|r| !r.is_stale()).collect();
        candidates.sort_by_key(|r| std::cmp::Reverse(r.updated_at));

        candidates
            .iter()
            .find(|r| r.contains(dir))
            .cloned()
            .or_else(|| candidates.into_iter().next())
    }

    /// Port this editor pid last served on; a restarted server tries it
    /// first so terminals that cached it keep working.
    pub fn sticky_port(&self, pid: u32) -> Option<u16> {
        let path = constants::sticky_port_path(&self.dir, pid);
        let text = std::fs::read_to_string(path).ok()?;
        text.trim().parse().ok()
    }

    pub fn remember_port(&self, pid: u32, port: u16) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("failed to create discovery directory: {e}");
            return;
        }
        let path = constants::sticky_port_path(&self.dir, pid);
        if let Err(e) = std::fs::write(&path, port.to_string()) {
            warn!("failed to record sticky port: {e}");
        }
    }
}

/// Signal-0 probe; EPERM still means the process exists.
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    matches!(
        kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(port: u16, roots: Vec<PathBuf>) -> ServerInstance {
        ServerInstance::new(port, AuthToken::generate(), roots)
    }

    #[test]
    fn publish_then_list_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let instance = instance(4242, vec![PathBuf::from("/work/project")]);
        let published = store.publish(&instance).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 4242);
        assert_eq!(listed[0].token, published.token);
        assert_eq!(listed[0].instance_id, instance.instance_id);
    }

    #[test]
    fn invalidate_removes_the_record() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let instance = instance(4242, vec![]);
        store.publish(&instance).unwrap();
        store.invalidate(instance.instance_id);
        assert!(store.list().is_empty());

        // Invalidating again is fine.
        store.invalidate(instance.instance_id);
    }

    #[test]
    fn corrupt_records_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let instance = instance(4242, vec![]);
        store.publish(&instance).unwrap();

        std::fs::write(
            dir.path()
                .join(format!("{}bogus.json", constants::DISCOVERY_FILE_PREFIX)),
            "{ not json",
        )
        .unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn select_prefers_workspace_containment_over_recency() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let here = instance(1111, vec![PathBuf::from("/work/here")]);
        store.publish(&here).unwrap();

        // Published measurably later, so it wins the recency fallback but
        // not containment.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elsewhere = instance(2222, vec![PathBuf::from("/work/elsewhere")]);
        store.publish(&elsewhere).unwrap();

        let selected = store.select_for(Path::new("/work/here/src")).unwrap();
        assert_eq!(selected.instance_id, here.instance_id);

        let fallback = store.select_for(Path::new("/somewhere/unrelated")).unwrap();
        assert_eq!(fallback.instance_id, elsewhere.instance_id);
    }

    #[test]
    fn resolver_reads_the_current_record_after_restart() {
        // Two launcher invocations with a server restart in between must
        // each see the record current at that moment, never a cached one.
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());
        let root = PathBuf::from("/work/project");

        let first = instance(1111, vec![root.clone()]);
        store.publish(&first).unwrap();
        let seen = store.select_for(&root).unwrap();
        assert_eq!(seen.port, 1111);

        // Restart: old instance deregisters, a new one binds a new port
        // with a new token.
        store.invalidate(first.instance_id);
        let second = instance(2222, vec![root.clone()]);
        store.publish(&second).unwrap();

        let seen = store.select_for(&root).unwrap();
        assert_eq!(seen.port, 2222);
        assert_eq!(seen.token, second.token.as_str());
    }

    #[test]
    fn concurrent_reader_never_observes_a_partial_record() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let instance = instance(4242, vec![PathBuf::from("/work/project")]);
        store.publish(&instance).unwrap();
        let record_path = store.record_path(instance.instance_id);

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_stop = stop.clone();
        let reader = std::thread::spawn(move || {
            let mut observed = 0usize;
            while !reader_stop.load(std::sync::atomic::Ordering::Relaxed) {
                if let Ok(text) = std::fs::read_to_string(&record_path) {
                    // Every observable file state must be a complete record.
                    serde_json::from_str::<DiscoveryRecord>(&text)
                        .expect("reader observed a partial discovery record");
                    observed += 1;
                }
            }
            observed
        });

        for _ in 0..500 {
            store.publish(&instance).unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        let observed = reader.join().unwrap();
        assert!(observed > 0, "reader should have seen the record");
    }

    #[test]
    fn invalidate_pid_sweeps_this_process_records() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        let old = instance(1111, vec![]);
        store.publish(&old).unwrap();
        let new = instance(2222, vec![]);

        store.invalidate_pid(std::process::id());
        store.publish(&new).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, new.instance_id);
    }

    #[test]
    fn sticky_port_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = DiscoveryStore::new(dir.path());

        assert_eq!(store.sticky_port(1234), None);
        store.remember_port(1234, 40123);
        assert_eq!(store.sticky_port(1234), Some(40123));
    }
}
