//! The fixed tool surface exposed over RPC
//!
//! A closed set of verbs, deliberately not a plugin registry: the allowlist
//! in the authorization grant is reviewed against exactly these names, and
//! adding one is a protocol version change.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::constants;
use crate::diff::DiffRegistryHandle;
use crate::editor::{EditorHandle, Position};
use crate::types::{CompanionError, ToolDescriptor};

/// The closed set of verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    OpenDiff,
    CloseDiff,
    NavigateTo,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "openDiff" => Some(ToolKind::OpenDiff),
            "closeDiff" => Some(ToolKind::CloseDiff),
            "navigateTo" => Some(ToolKind::NavigateTo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::OpenDiff => "openDiff",
            ToolKind::CloseDiff => "closeDiff",
            ToolKind::NavigateTo => "navigateTo",
        }
    }
}

/// Parameters for the openDiff tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenDiffParams {
    /// Absolute path of the file the change targets
    pub file_path: String,
    /// Full proposed content for the file
    pub proposed_content: String,
    /// Short rationale shown alongside the diff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Wait for the user's accept/reject instead of returning immediately
    #[serde(default)]
    pub blocking: bool,
}

/// Parameters for the closeDiff tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloseDiffParams {
    /// Path whose proposed diff should be closed
    pub file_path: String,
    /// Specific session to close; defaults to the current proposed session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Parameters for the navigateTo tool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NavigateToParams {
    /// File to open and focus
    pub file_path: String,
    /// 1-based line number; clamped into the file's bounds
    pub line: u32,
    /// 1-based character column; clamped into the line's bounds
    #[serde(default = "default_character")]
    pub character: u32,
}

fn default_character() -> u32 {
    1
}

/// Descriptors returned by `tools/list`.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: ToolKind::OpenDiff.name().to_string(),
            description: "Open a proposed change to a file as a reviewable diff. \
                          Nothing is written to disk until the user accepts."
                .to_string(),
            input_schema: input_schema::<OpenDiffParams>(),
        },
        ToolDescriptor {
            name: ToolKind::CloseDiff.name().to_string(),
            description: "Withdraw a proposed diff before the user resolves it.".to_string(),
            input_schema: input_schema::<CloseDiffParams>(),
        },
        ToolDescriptor {
            name: ToolKind::NavigateTo.name().to_string(),
            description: "Open a file and move editor focus to a line and column.".to_string(),
            input_schema: input_schema::<NavigateToParams>(),
        },
    ]
}

fn input_schema<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Dispatches authenticated tool calls into the registry and the editor.
#[derive(Clone)]
pub struct ToolRouter {
    registry: DiffRegistryHandle,
    editor: EditorHandle,
    workspace_roots: Arc<Vec<PathBuf>>,
}

impl ToolRouter {
    pub fn new(
        registry: DiffRegistryHandle,
        editor: EditorHandle,
        workspace_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            registry,
            editor,
            workspace_roots: Arc::new(workspace_roots),
        }
    }

    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
        tool_call_id: Option<String>,
    ) -> Result<serde_json::Value, CompanionError> {
        let Some(kind) = ToolKind::from_name(name) else {
            return Err(CompanionError::ToolNotFound(name.to_string()));
        };
        debug!("dispatching tool call {}", kind.name());

        match kind {
            ToolKind::OpenDiff => {
                self.open_diff(parse_params(arguments)?, tool_call_id).await
            }
            ToolKind::CloseDiff => self.close_diff(parse_params(arguments)?).await,
            ToolKind::NavigateTo => self.navigate_to(parse_params(arguments)?).await,
        }
    }

    async fn open_diff(
        &self,
        params: OpenDiffParams,
        tool_call_id: Option<String>,
    ) -> Result<serde_json::Value, CompanionError> {
        let path = self.require_in_scope(&params.file_path)?;

        if params.blocking {
            // Subscribe before opening so the resolution cannot slip past us.
            let mut events = self.registry.subscribe();
            let session_id = self
                .registry
                .open_diff(
                    path,
                    params.proposed_content,
                    params.explanation,
                    tool_call_id,
                )
                .await?;

            let wait = async {
                loop {
                    match events.recv().await {
                        Ok(event) if event.session_id == session_id => break Some(event),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break None,
                    }
                }
            };
            let timeout =
                std::time::Duration::from_secs(constants::BLOCKING_RESOLUTION_TIMEOUT_SECS);
            match tokio::time::timeout(timeout, wait).await {
                Ok(Some(event)) => Ok(serde_json::json!({
                    "sessionId": session_id,
                    "status": event.status,
                    "content": event.content,
                })),
                Ok(None) => Err(CompanionError::Internal("diff registry is gone".into())),
                Err(_) => Err(CompanionError::StateConflict(
                    "timed out waiting for the user to resolve the diff".into(),
                )),
            }
        } else {
            let session_id = self
                .registry
                .open_diff(
                    path,
                    params.proposed_content,
                    params.explanation,
                    tool_call_id,
                )
                .await?;
            Ok(serde_json::json!({
                "sessionId": session_id,
                "status": "proposed",
            }))
        }
    }

    async fn close_diff(
        &self,
        params: CloseDiffParams,
    ) -> Result<serde_json::Value, CompanionError> {
        let path = normalize_path(Path::new(&params.file_path));
        let session_id = match params.session_id.as_deref() {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|e| {
                CompanionError::InvalidArguments(format!("sessionId: {e}"))
            })?),
            None => None,
        };
        let session_id = self.registry.close_diff(path, session_id).await?;
        Ok(serde_json::json!({
            "sessionId": session_id,
            "status": "closed",
        }))
    }

    async fn navigate_to(
        &self,
        params: NavigateToParams,
    ) -> Result<serde_json::Value, CompanionError> {
        // Navigation works regardless of any diff session on the path.
        let path = normalize_path(Path::new(&params.file_path));
        let content = self
            .editor
            .read_buffer(&path)
            .await
            .map_err(|e| CompanionError::Internal(e.to_string()))?;

        let position = clamp_position(&content, params.line, params.character);
        self.editor
            .focus(&path, position)
            .await
            .map_err(|e| CompanionError::Internal(e.to_string()))?;

        Ok(serde_json::json!({
            "filePath": path,
            "line": position.line,
            "character": position.character,
        }))
    }

    fn require_in_scope(&self, raw: &str) -> Result<PathBuf, CompanionError> {
        let path = normalize_path(Path::new(raw));
        if self.workspace_roots.iter().any(|root| path.starts_with(root)) {
            Ok(path)
        } else {
            Err(CompanionError::OutOfScopePath(path))
        }
    }
}

fn parse_params<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T, CompanionError> {
    // serde's message names the offending field ("missing field `filePath`").
    serde_json::from_value(arguments).map_err(|e| CompanionError::InvalidArguments(e.to_string()))
}

/// Lexical cleanup of `.` and `..` components; target files need not exist
/// yet, so filesystem canonicalization is not an option.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Clamp a 1-based position into the content's real bounds. Cursor races
/// with concurrent edits are expected and non-fatal, so out-of-range input
/// resolves to the nearest valid position instead of erroring.
pub fn clamp_position(content: &str, line: u32, character: u32) -> Position {
    let lines: Vec<&str> = content.lines().collect();
    let line_count = lines.len().max(1) as u32;
    let line = line.clamp(1, line_count);
    let line_len = lines
        .get(line as usize - 1)
        .map(|l| l.chars().count())
        .unwrap_or(0) as u32;
    let character = character.clamp(1, line_len + 1);
    Position { line, character }
}
