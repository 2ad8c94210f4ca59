//! Diff proposal registry: the authoritative lifecycle for every proposed
//! change
//!
//! A single actor owns the session map, so mutations for any one target file
//! are applied in arrival order: of two concurrent `openDiff` calls against
//! the same path, whichever the channel delivers second sees the first's
//! session and supersedes it, and the superseded decorations are retracted
//! before the new ones render. Resolution is exposed only on the
//! editor-facing handle; no tool call can force it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use similar::{DiffTag, TextDiff};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::Actor;
use crate::editor::{DecorationSet, EditorHandle, Position};
use crate::types::{ChangeKind, ChangeRegion, CompanionError};

/// Lifecycle of one proposed change. `Proposed` is the only non-terminal
/// state; a resolved session can never be re-opened, only superseded by a
/// brand-new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Proposed,
    Accepted,
    Rejected,
    Superseded,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Proposed)
    }
}

/// One proposed change to one target file. Owned exclusively by the
/// registry; handlers only ever see clones.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSession {
    pub session_id: Uuid,
    pub path: PathBuf,
    /// Buffer content captured before any speculative preview.
    pub original: String,
    pub proposed: String,
    pub regions: Vec<ChangeRegion>,
    pub state: SessionState,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How a session left the `Proposed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Accepted,
    Rejected,
    Closed,
}

/// Broadcast to connected clients when a session resolves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionEvent {
    pub session_id: Uuid,
    pub file_path: PathBuf,
    pub status: ResolutionStatus,
    /// Final file content, present on acceptance.
    pub content: Option<String>,
}

/// Line-level change regions of `proposed` relative to `original`: added
/// blocks span their lines in the proposed content, removed blocks are
/// zero-width anchors where the removed text used to be.
pub fn change_regions(original: &str, proposed: &str) -> Vec<ChangeRegion> {
    let diff = TextDiff::from_lines(original, proposed);
    let mut regions = Vec::new();
    for op in diff.ops() {
        let new_range = op.new_range();
        match op.tag() {
            DiffTag::Equal => {}
            DiffTag::Insert => {
                regions.push(ChangeRegion {
                    kind: ChangeKind::Added,
                    start_line: new_range.start as u32 + 1,
                    end_line: new_range.end as u32 + 1,
                });
            }
            DiffTag::Delete => {
                regions.push(ChangeRegion {
                    kind: ChangeKind::Removed,
                    start_line: new_range.start as u32 + 1,
                    end_line: new_range.start as u32 + 1,
                });
            }
            DiffTag::Replace => {
                regions.push(ChangeRegion {
                    kind: ChangeKind::Removed,
                    start_line: new_range.start as u32 + 1,
                    end_line: new_range.start as u32 + 1,
                });
                regions.push(ChangeRegion {
                    kind: ChangeKind::Added,
                    start_line: new_range.start as u32 + 1,
                    end_line: new_range.end as u32 + 1,
                });
            }
        }
    }
    regions
}

enum RegistryCommand {
    OpenDiff {
        path: PathBuf,
        proposed: String,
        explanation: Option<String>,
        tool_call_id: Option<String>,
        reply: oneshot::Sender<Result<Uuid, CompanionError>>,
    },
    CloseDiff {
        path: PathBuf,
        session_id: Option<Uuid>,
        reply: oneshot::Sender<Result<Uuid, CompanionError>>,
    },
    Resolve {
        path: PathBuf,
        accepted: bool,
        reply: oneshot::Sender<Result<ResolutionEvent, CompanionError>>,
    },
    ProposedFor {
        path: PathBuf,
        reply: oneshot::Sender<Option<DiffSession>>,
    },
    Session {
        session_id: Uuid,
        reply: oneshot::Sender<Option<DiffSession>>,
    },
}

struct DiffRegistryActor {
    command_rx: mpsc::Receiver<RegistryCommand>,
    editor: EditorHandle,

    /// The single `Proposed` session per target path.
    active: HashMap<PathBuf, DiffSession>,

    /// Terminal sessions, kept in memory for idempotence checks and
    /// inspection. Nothing persists across editor restarts.
    archive: HashMap<Uuid, DiffSession>,

    events_tx: broadcast::Sender<ResolutionEvent>,
}

impl Actor for DiffRegistryActor {
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                RegistryCommand::OpenDiff {
                    path,
                    proposed,
                    explanation,
                    tool_call_id,
                    reply,
                } => {
                    let result = self
                        .open_diff(path, proposed, explanation, tool_call_id)
                        .await;
                    let _ = reply.send(result);
                }
                RegistryCommand::CloseDiff { path, session_id, reply } => {
                    let _ = reply.send(self.close_diff(path, session_id).await);
                }
                RegistryCommand::Resolve { path, accepted, reply } => {
                    let _ = reply.send(self.resolve(path, accepted).await);
                }
                RegistryCommand::ProposedFor { path, reply } => {
                    let _ = reply.send(self.active.get(&path).cloned());
                }
                RegistryCommand::Session { session_id, reply } => {
                    let session = self
                        .active
                        .values()
                        .find(|s| s.session_id == session_id)
                        .or_else(|| self.archive.get(&session_id))
                        .cloned();
                    let _ = reply.send(session);
                }
            }
        }
        info!("diff registry actor stopped");
    }
}

impl DiffRegistryActor {
    async fn open_diff(
        &mut self,
        path: PathBuf,
        proposed: String,
        explanation: Option<String>,
        tool_call_id: Option<String>,
    ) -> Result<Uuid, CompanionError> {
        // Supersede any unresolved proposal for this path. Its decorations
        // come down before the new ones render, so the user never sees two
        // overlapping highlight sets.
        let prior_original = match self.active.remove(&path) {
            Some(mut prior) => {
                if let Err(e) = self.editor.retract_decorations(&path).await {
                    warn!(
                        "failed to retract superseded decorations for {}: {e}",
                        path.display()
                    );
                }
                debug!(
                    "superseding session {} for {}",
                    prior.session_id,
                    path.display()
                );
                prior.state = SessionState::Superseded;
                let original = prior.original.clone();
                self.archive.insert(prior.session_id, prior);
                Some(original)
            }
            None => None,
        };

        // The snapshot is the pre-session buffer content. When superseding,
        // the buffer currently shows the prior preview, so the prior
        // session's snapshot carries over.
        let original = match prior_original {
            Some(original) => original,
            None => self
                .editor
                .read_buffer(&path)
                .await
                .map_err(|e| CompanionError::Internal(e.to_string()))?,
        };

        let regions = change_regions(&original, &proposed);
        let session = DiffSession {
            session_id: Uuid::new_v4(),
            path: path.clone(),
            original,
            proposed: proposed.clone(),
            regions: regions.clone(),
            state: SessionState::Proposed,
            tool_call_id,
            created_at: Utc::now(),
        };

        self.editor
            .preview_buffer(&path, &proposed)
            .await
            .map_err(|e| CompanionError::Internal(e.to_string()))?;
        self.editor
            .render_decorations(
                &path,
                DecorationSet::new(session.session_id, regions, explanation),
            )
            .await
            .map_err(|e| CompanionError::Internal(e.to_string()))?;

        // Scroll to the first change; best effort.
        if let Some(first) = session.regions.first() {
            let position = Position { line: first.start_line, character: 1 };
            if let Err(e) = self.editor.focus(&path, position).await {
                debug!("failed to focus first change: {e}");
            }
        }

        let session_id = session.session_id;
        self.active.insert(path, session);
        Ok(session_id)
    }

    async fn close_diff(
        &mut self,
        path: PathBuf,
        session_id: Option<Uuid>,
    ) -> Result<Uuid, CompanionError> {
        let active_id = self.active.get(&path).map(|s| s.session_id);
        match active_id {
            Some(active) if session_id.is_none_or(|id| id == active) => {
                let mut session = match self.active.remove(&path) {
                    Some(session) => session,
                    None => {
                        return Err(CompanionError::Internal(
                            "session vanished during close".to_string(),
                        ));
                    }
                };
                if let Err(e) = self.editor.retract_decorations(&path).await {
                    warn!("failed to retract decorations for {}: {e}", path.display());
                }
                if let Err(e) = self.editor.preview_buffer(&path, &session.original).await {
                    warn!("failed to restore buffer for {}: {e}", path.display());
                }
                session.state = SessionState::Closed;
                let event = ResolutionEvent {
                    session_id: session.session_id,
                    file_path: path,
                    status: ResolutionStatus::Closed,
                    content: None,
                };
                self.archive.insert(session.session_id, session);
                let _ = self.events_tx.send(event);
                Ok(active)
            }
            _ => {
                // Closing an already-closed session by matching id is a
                // retried request, not a conflict.
                if let Some(id) = session_id {
                    if let Some(prior) = self.archive.get(&id) {
                        if prior.state == SessionState::Closed && prior.path == path {
                            return Ok(id);
                        }
                    }
                }
                // Anything else signals a protocol desync between the CLI
                // and the editor state; report it, don't swallow it.
                Err(CompanionError::StateConflict(format!(
                    "no matching proposed diff session for {}",
                    path.display()
                )))
            }
        }
    }

    async fn resolve(
        &mut self,
        path: PathBuf,
        accepted: bool,
    ) -> Result<ResolutionEvent, CompanionError> {
        let Some(mut session) = self.active.remove(&path) else {
            return Err(CompanionError::StateConflict(format!(
                "no proposed diff session for {}",
                path.display()
            )));
        };

        if let Err(e) = self.editor.retract_decorations(&path).await {
            warn!("failed to retract decorations for {}: {e}", path.display());
        }

        let event = if accepted {
            if let Err(e) = self.editor.commit_buffer(&path, &session.proposed).await {
                // Leave the session resolvable rather than losing the
                // proposal to a transient write failure.
                self.active.insert(path, session);
                return Err(CompanionError::Internal(format!(
                    "failed to apply accepted content: {e}"
                )));
            }
            session.state = SessionState::Accepted;
            ResolutionEvent {
                session_id: session.session_id,
                file_path: path,
                status: ResolutionStatus::Accepted,
                content: Some(session.proposed.clone()),
            }
        } else {
            if let Err(e) = self.editor.preview_buffer(&path, &session.original).await {
                warn!("failed to restore buffer for {}: {e}", path.display());
            }
            session.state = SessionState::Rejected;
            ResolutionEvent {
                session_id: session.session_id,
                file_path: path,
                status: ResolutionStatus::Rejected,
                content: None,
            }
        };

        self.archive.insert(session.session_id, session);
        let _ = self.events_tx.send(event.clone());
        Ok(event)
    }
}

/// Handle for the diff registry actor. Tool handlers obtain sessions only
/// through this API, never by constructing them.
#[derive(Clone)]
pub struct DiffRegistryHandle {
    command_tx: mpsc::Sender<RegistryCommand>,
    events_tx: broadcast::Sender<ResolutionEvent>,
}

impl DiffRegistryHandle {
    pub fn new(editor: EditorHandle) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (events_tx, _) = broadcast::channel(64);
        DiffRegistryActor {
            command_rx,
            editor,
            active: HashMap::new(),
            archive: HashMap::new(),
            events_tx: events_tx.clone(),
        }
        .spawn();
        Self { command_tx, events_tx }
    }

    /// Resolution events, delivered to every subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolutionEvent> {
        self.events_tx.subscribe()
    }

    pub async fn open_diff(
        &self,
        path: PathBuf,
        proposed: String,
        explanation: Option<String>,
        tool_call_id: Option<String>,
    ) -> Result<Uuid, CompanionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::OpenDiff {
            path,
            proposed,
            explanation,
            tool_call_id,
            reply,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| CompanionError::Internal("diff registry dropped the request".into()))?
    }

    pub async fn close_diff(
        &self,
        path: PathBuf,
        session_id: Option<Uuid>,
    ) -> Result<Uuid, CompanionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::CloseDiff { path, session_id, reply })
            .await?;
        reply_rx
            .await
            .map_err(|_| CompanionError::Internal("diff registry dropped the request".into()))?
    }

    /// User-driven resolution, surfaced through editor UI controls. This is
    /// a trust boundary: the CLI may propose, only the user commits.
    pub async fn resolve(
        &self,
        path: PathBuf,
        accepted: bool,
    ) -> Result<ResolutionEvent, CompanionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(RegistryCommand::Resolve { path, accepted, reply })
            .await?;
        reply_rx
            .await
            .map_err(|_| CompanionError::Internal("diff registry dropped the request".into()))?
    }

    pub async fn proposed_for(&self, path: &Path) -> Option<DiffSession> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(RegistryCommand::ProposedFor { path: path.to_path_buf(), reply })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn session(&self, session_id: Uuid) -> Option<DiffSession> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(RegistryCommand::Session { session_id, reply })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    async fn send(&self, command: RegistryCommand) -> Result<(), CompanionError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| CompanionError::Internal("diff registry is gone".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::WorkspaceEditor;
    use tempfile::TempDir;

    fn harness() -> (TempDir, WorkspaceEditor, DiffRegistryHandle) {
        let dir = TempDir::new().unwrap();
        let editor = WorkspaceEditor::new();
        let registry = DiffRegistryHandle::new(EditorHandle::new(editor.clone()));
        (dir, editor, registry)
    }

    #[test]
    fn change_regions_tag_added_and_removed_lines() {
        let regions = change_regions("print(1)\nprint(2)\n", "print(1)\nprint(3)\n");
        assert_eq!(
            regions,
            vec![
                ChangeRegion { kind: ChangeKind::Removed, start_line: 2, end_line: 2 },
                ChangeRegion { kind: ChangeKind::Added, start_line: 2, end_line: 3 },
            ]
        );
    }

    #[test]
    fn change_regions_of_identical_content_are_empty() {
        assert!(change_regions("same\n", "same\n").is_empty());
    }

    #[test]
    fn change_regions_for_a_new_file_cover_everything() {
        let regions = change_regions("", "a\nb\n");
        assert_eq!(
            regions,
            vec![ChangeRegion { kind: ChangeKind::Added, start_line: 1, end_line: 3 }]
        );
    }

    #[tokio::test]
    async fn at_most_one_proposed_session_per_path() {
        let (dir, editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\nprint(2)\n").unwrap();

        let first = registry
            .open_diff(path.clone(), "print(1)\nprint(3)\n".into(), None, None)
            .await
            .unwrap();
        let second = registry
            .open_diff(path.clone(), "print(1)\nprint(4)\n".into(), None, None)
            .await
            .unwrap();

        let superseded = registry.session(first).await.unwrap();
        assert_eq!(superseded.state, SessionState::Superseded);

        let current = registry.proposed_for(&path).await.unwrap();
        assert_eq!(current.session_id, second);
        assert_eq!(current.state, SessionState::Proposed);
        // The chain's snapshot is still the pre-session content.
        assert_eq!(current.original, "print(1)\nprint(2)\n");

        // Only the new session's decorations are visible.
        assert_eq!(editor.decorations_for(&path).unwrap().session_id, second);
    }

    #[tokio::test]
    async fn accept_applies_the_proposed_content() {
        let (dir, _editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        let session_id = registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        let event = registry.resolve(path.clone(), true).await.unwrap();

        assert_eq!(event.session_id, session_id);
        assert_eq!(event.status, ResolutionStatus::Accepted);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print(2)\n");
        assert_eq!(
            registry.session(session_id).await.unwrap().state,
            SessionState::Accepted
        );
    }

    #[tokio::test]
    async fn reject_restores_the_snapshot() {
        let (dir, editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        // Preview altered the buffer speculatively.
        assert_eq!(editor.buffer(&path).unwrap(), "print(2)\n");

        let event = registry.resolve(path.clone(), false).await.unwrap();
        assert_eq!(event.status, ResolutionStatus::Rejected);
        // Buffer restored, disk untouched.
        assert_eq!(editor.buffer(&path).unwrap(), "print(1)\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print(1)\n");
    }

    #[tokio::test]
    async fn resolution_is_final_per_session() {
        let (dir, _editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        registry.resolve(path.clone(), true).await.unwrap();

        let err = registry.resolve(path.clone(), false).await.unwrap_err();
        assert!(matches!(err, CompanionError::StateConflict(_)));
    }

    #[tokio::test]
    async fn close_without_a_session_is_a_state_conflict() {
        let (dir, _editor, registry) = harness();
        let path = dir.path().join("a.py");

        let err = registry.close_diff(path, None).await.unwrap_err();
        assert!(matches!(err, CompanionError::StateConflict(_)));
    }

    #[tokio::test]
    async fn closing_an_already_closed_session_by_id_is_a_noop() {
        let (dir, _editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        let session_id = registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        registry
            .close_diff(path.clone(), Some(session_id))
            .await
            .unwrap();

        // Retried close of the same terminal session succeeds quietly.
        let again = registry
            .close_diff(path.clone(), Some(session_id))
            .await
            .unwrap();
        assert_eq!(again, session_id);

        // But a bare close with nothing proposed is still a conflict.
        let err = registry.close_diff(path, None).await.unwrap_err();
        assert!(matches!(err, CompanionError::StateConflict(_)));
    }

    #[tokio::test]
    async fn close_restores_the_previewed_buffer() {
        let (dir, editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        registry.close_diff(path.clone(), None).await.unwrap();

        assert_eq!(editor.buffer(&path).unwrap(), "print(1)\n");
        assert!(editor.decorations_for(&path).is_none());
    }

    #[tokio::test]
    async fn resolution_events_reach_subscribers() {
        let (dir, _editor, registry) = harness();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "print(1)\n").unwrap();

        let mut events = registry.subscribe();
        let session_id = registry
            .open_diff(path.clone(), "print(2)\n".into(), None, None)
            .await
            .unwrap();
        registry.resolve(path.clone(), true).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id, session_id);
        assert_eq!(event.status, ResolutionStatus::Accepted);
        assert_eq!(event.content.as_deref(), Some("print(2)\n"));
    }
}
