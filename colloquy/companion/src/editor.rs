//! Editor view boundary
//!
//! The companion never reaches into editor internals; it drives this
//! capability surface. Every view mutation is marshaled onto one actor task
//! (the editor's UI-affine execution context) so network-received tool calls
//! never race on the visible buffer, and network I/O never blocks on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::actor::Actor;
use crate::types::ChangeRegion;

/// 1-based cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// Decoration payload rendered over a buffer while a proposal is pending:
/// the highlighted change blocks plus accept/reject affordances anchored at
/// the top and bottom of the changed span, so long files stay resolvable
/// without scrolling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecorationSet {
    pub session_id: Uuid,
    pub regions: Vec<ChangeRegion>,
    pub explanation: Option<String>,
    pub control_anchors: [Position; 2],
}

impl DecorationSet {
    pub fn new(session_id: Uuid, regions: Vec<ChangeRegion>, explanation: Option<String>) -> Self {
        let top = regions
            .first()
            .map(|r| Position { line: r.start_line, character: 1 })
            .unwrap_or(Position { line: 1, character: 1 });
        let bottom = regions
            .last()
            .map(|r| Position { line: r.end_line.max(r.start_line), character: 1 })
            .unwrap_or(top);
        Self {
            session_id,
            regions,
            explanation,
            control_anchors: [top, bottom],
        }
    }
}

/// Opaque capability surface the embedding editor provides. Implementations
/// run on the editor actor task, so they may assume single-threaded access.
pub trait EditorApi: Send + 'static {
    /// Current buffer content, falling back to disk for files that are not
    /// open. Missing files read as empty (new-file proposals).
    fn read_buffer(&mut self, path: &Path) -> anyhow::Result<String>;

    /// Replace the visible buffer content without touching disk (speculative
    /// diff preview).
    fn preview_buffer(&mut self, path: &Path, content: &str) -> anyhow::Result<()>;

    /// Make `content` the durable file content (acceptance).
    fn commit_buffer(&mut self, path: &Path, content: &str) -> anyhow::Result<()>;

    /// Render one decoration set over the buffer, replacing any prior set.
    fn render_decorations(&mut self, path: &Path, decorations: DecorationSet)
    -> anyhow::Result<()>;

    /// Remove the decoration set for `path`, if any.
    fn retract_decorations(&mut self, path: &Path) -> anyhow::Result<()>;

    /// Move editor focus to an already-clamped position.
    fn focus(&mut self, path: &Path, position: Position) -> anyhow::Result<()>;
}

enum EditorCommand {
    ReadBuffer {
        path: PathBuf,
        reply: oneshot::Sender<anyhow::Result<String>>,
    },
    PreviewBuffer {
        path: PathBuf,
        content: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    CommitBuffer {
        path: PathBuf,
        content: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    RenderDecorations {
        path: PathBuf,
        decorations: DecorationSet,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    RetractDecorations {
        path: PathBuf,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Focus {
        path: PathBuf,
        position: Position,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Actor that owns the editor capability and serializes all view mutations.
struct EditorActor {
    api: Box<dyn EditorApi>,
    command_rx: mpsc::Receiver<EditorCommand>,
}

impl Actor for EditorActor {
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                EditorCommand::ReadBuffer { path, reply } => {
                    let _ = reply.send(self.api.read_buffer(&path));
                }
                EditorCommand::PreviewBuffer { path, content, reply } => {
                    let _ = reply.send(self.api.preview_buffer(&path, &content));
                }
                EditorCommand::CommitBuffer { path, content, reply } => {
                    let _ = reply.send(self.api.commit_buffer(&path, &content));
                }
                EditorCommand::RenderDecorations { path, decorations, reply } => {
                    let _ = reply.send(self.api.render_decorations(&path, decorations));
                }
                EditorCommand::RetractDecorations { path, reply } => {
                    let _ = reply.send(self.api.retract_decorations(&path));
                }
                EditorCommand::Focus { path, position, reply } => {
                    let _ = reply.send(self.api.focus(&path, position));
                }
            }
        }
        info!("editor actor stopped");
    }
}

/// Handle for marshaling view operations onto the editor actor.
#[derive(Clone)]
pub struct EditorHandle {
    command_tx: mpsc::Sender<EditorCommand>,
}

impl EditorHandle {
    pub fn new(api: impl EditorApi) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        EditorActor {
            api: Box::new(api),
            command_rx,
        }
        .spawn();
        Self { command_tx }
    }

    async fn request<T>(
        &self,
        command: EditorCommand,
        reply_rx: oneshot::Receiver<anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("editor actor is gone"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("editor actor dropped the request"))?
    }

    pub async fn read_buffer(&self, path: &Path) -> anyhow::Result<String> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::ReadBuffer { path: path.to_path_buf(), reply },
            reply_rx,
        )
        .await
    }

    pub async fn preview_buffer(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::PreviewBuffer {
                path: path.to_path_buf(),
                content: content.to_string(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    pub async fn commit_buffer(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::CommitBuffer {
                path: path.to_path_buf(),
                content: content.to_string(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    pub async fn render_decorations(
        &self,
        path: &Path,
        decorations: DecorationSet,
    ) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::RenderDecorations {
                path: path.to_path_buf(),
                decorations,
                reply,
            },
            reply_rx,
        )
        .await
    }

    pub async fn retract_decorations(&self, path: &Path) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::RetractDecorations { path: path.to_path_buf(), reply },
            reply_rx,
        )
        .await
    }

    pub async fn focus(&self, path: &Path, position: Position) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            EditorCommand::Focus { path: path.to_path_buf(), position, reply },
            reply_rx,
        )
        .await
    }
}

#[derive(Default)]
struct WorkspaceEditorState {
    buffers: HashMap<PathBuf, String>,
    decorations: HashMap<PathBuf, DecorationSet>,
    focused: Option<(PathBuf, Position)>,
}

/// Disk-backed editor adapter used by the bundled binary and the tests.
/// State lives behind a shared handle so an embedder (or a test) can inspect
/// what is currently rendered.
#[derive(Clone, Default)]
pub struct WorkspaceEditor {
    state: Arc<Mutex<WorkspaceEditorState>>,
}

impl WorkspaceEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self, path: &Path) -> Option<String> {
        self.state.lock().unwrap().buffers.get(path).cloned()
    }

    pub fn decorations_for(&self, path: &Path) -> Option<DecorationSet> {
        self.state.lock().unwrap().decorations.get(path).cloned()
    }

    pub fn focused(&self) -> Option<(PathBuf, Position)> {
        self.state.lock().unwrap().focused.clone()
    }
}

impl EditorApi for WorkspaceEditor {
    fn read_buffer(&mut self, path: &Path) -> anyhow::Result<String> {
        let state = self.state.lock().unwrap();
        if let Some(content) = state.buffers.get(path) {
            return Ok(content.clone());
        }
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn preview_buffer(&mut self, path: &Path, content: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn commit_buffer(&mut self, path: &Path, content: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        self.state
            .lock()
            .unwrap()
            .buffers
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn render_decorations(
        &mut self,
        path: &Path,
        decorations: DecorationSet,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .decorations
            .insert(path.to_path_buf(), decorations);
        Ok(())
    }

    fn retract_decorations(&mut self, path: &Path) -> anyhow::Result<()> {
        self.state.lock().unwrap().decorations.remove(path);
        Ok(())
    }

    fn focus(&mut self, path: &Path, position: Position) -> anyhow::Result<()> {
        self.state.lock().unwrap().focused = Some((path.to_path_buf(), position));
        Ok(())
    }
}
