//! Loopback JSON-RPC server
//!
//! Binds an ephemeral loopback port, publishes the discovery record, and
//! serves line-delimited JSON-RPC 2.0. A connection must present the
//! instance token as a control line before any traffic and complete the
//! `initialize` handshake within a bounded window; after that, tool calls
//! are re-verified against the gatekeeper on every request, and resolution
//! notifications are pushed to every authenticated client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth::Gatekeeper;
use crate::constants;
use crate::diff::{DiffRegistryHandle, ResolutionEvent, ResolutionStatus};
use crate::discovery::{DiscoveryStore, ServerInstance};
use crate::editor::EditorHandle;
use crate::tools::{self, ToolRouter};
use crate::types::{
    CompanionError, InitializeParams, InitializeResult, Notification, PeerInfo, Request, Response,
    RpcError, ServerCapabilities, ToolCallParams,
};

/// The editor-side companion server: one per editor process.
pub struct CompanionServer {
    instance: ServerInstance,
    gatekeeper: Arc<Gatekeeper>,
    store: DiscoveryStore,
    router: ToolRouter,
    registry: DiffRegistryHandle,
    listener: TcpListener,
}

impl CompanionServer {
    /// Bind the loopback port, mint the instance token, and publish the
    /// discovery record. The sticky port from a previous run of this editor
    /// process is tried first so terminals that cached it keep working.
    pub async fn bind(
        store: DiscoveryStore,
        editor: EditorHandle,
        workspace_roots: Vec<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let gatekeeper = Arc::new(Gatekeeper::new());
        let pid = std::process::id();

        let listener = match store.sticky_port(pid) {
            Some(port) => match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    info!("sticky port {port} unavailable ({e}), falling back to ephemeral");
                    TcpListener::bind(("127.0.0.1", 0)).await?
                }
            },
            None => TcpListener::bind(("127.0.0.1", 0)).await?,
        };
        let port = listener
            .local_addr()
            .context("failed to read bound address")?
            .port();
        store.remember_port(pid, port);

        // A rebind replaces whatever this process advertised before.
        store.invalidate_pid(pid);

        let instance = ServerInstance::new(port, gatekeeper.token().clone(), workspace_roots.clone());
        store
            .publish(&instance)
            .context("failed to publish discovery record")?;
        info!(
            "companion server bound to 127.0.0.1:{port} as instance {}",
            instance.instance_id
        );

        let registry = DiffRegistryHandle::new(editor.clone());
        let router = ToolRouter::new(registry.clone(), editor, workspace_roots);

        Ok(Self {
            instance,
            gatekeeper,
            store,
            router,
            registry,
            listener,
        })
    }

    pub fn port(&self) -> u16 {
        self.instance.port
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    /// Editor-facing resolution API; the embedding editor's accept/reject
    /// controls go through this, never through a tool call.
    pub fn registry(&self) -> &DiffRegistryHandle {
        &self.registry
    }

    /// Accept loop plus the periodic discovery refresh. Runs until the
    /// listener fails; callers typically race it against a shutdown signal.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut refresh =
            tokio::time::interval(Duration::from_secs(constants::DISCOVERY_REFRESH_SECS));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The record was already published at bind; skip the immediate tick.
        refresh.tick().await;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, addr) = result.context("failed to accept connection")?;
                    debug!("connection accepted from {addr}");
                    let connection = Connection {
                        gatekeeper: Arc::clone(&self.gatekeeper),
                        router: self.router.clone(),
                        registry: self.registry.clone(),
                    };
                    tokio::spawn(connection.run(stream));
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.store.refresh(&self.instance) {
                        warn!("failed to refresh discovery record: {e}");
                    }
                }
            }
        }
    }

    /// Deregister the discovery record. Called before the listener is
    /// dropped, closing the window where a stale record points at a freed
    /// port another process could rebind.
    pub fn shutdown(&self) {
        self.store.invalidate(self.instance.instance_id);
        info!(
            "deregistered discovery record for instance {}",
            self.instance.instance_id
        );
    }
}

struct Connection {
    gatekeeper: Arc<Gatekeeper>,
    router: ToolRouter,
    registry: DiffRegistryHandle,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        if let Err(e) = self.serve(stream).await {
            debug!("connection ended: {e:#}");
        }
    }

    async fn serve(self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let handshake_window = Duration::from_secs(constants::HANDSHAKE_TIMEOUT_SECS);

        // Credential preamble: one control line before any JSON-RPC
        // traffic. A bad token gets the same silence as a missing one.
        let line = match read_line_with_timeout(&mut reader, handshake_window).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let presented = match line.trim().strip_prefix("#authorization:") {
            Some(token) if self.gatekeeper.verify(token.trim()) => token.trim().to_string(),
            _ => {
                info!("rejecting connection with bad or missing credential");
                return Ok(());
            }
        };

        // Handshake: the first request must be `initialize`, inside the
        // same bounded window.
        let line = match read_line_with_timeout(&mut reader, handshake_window).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) if request.method == "initialize" => {
                let response = initialize_response(&request);
                write_json(&mut write_half, &response).await?;
                if response.error.is_some() {
                    return Ok(());
                }
            }
            Ok(request) => {
                let error = CompanionError::ProtocolError(format!(
                    "expected initialize, got {}",
                    request.method
                ));
                write_json(&mut write_half, &Response::failure(request.id, error.to_rpc_error()))
                    .await?;
                return Ok(());
            }
            Err(e) => {
                write_json(&mut write_half, &Response::failure(None, RpcError::parse_error(&e)))
                    .await?;
                return Ok(());
            }
        }

        let mut events = self.registry.subscribe();
        let mut auth_failures = 0u32;
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                result = reader.read_line(&mut line) => {
                    match result {
                        // Peer closed; connection state goes, but proposed
                        // sessions stay for the user to resolve.
                        Ok(0) => break,
                        Ok(_) => {
                            let text = line.trim();
                            if text.is_empty() || text.starts_with('#') {
                                continue;
                            }
                            if let Some(response) =
                                self.handle_line(text, &presented, &mut auth_failures).await
                            {
                                write_json(&mut write_half, &response).await?;
                            }
                            if auth_failures >= constants::MAX_AUTH_FAILURES {
                                info!(
                                    "closing connection after {auth_failures} authentication failures"
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("connection read error: {e}");
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            write_json(&mut write_half, &notification_for(&event)).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("dropped {skipped} resolution notifications");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_line(
        &self,
        text: &str,
        presented: &str,
        auth_failures: &mut u32,
    ) -> Option<Response> {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => return Some(Response::failure(None, RpcError::parse_error(&e))),
        };
        // Id-less requests are notifications; process nothing, answer
        // nothing.
        let id = request.id.clone()?;

        match request.method.as_str() {
            "initialize" => Some(initialize_response(&request)),
            "tools/list" => Some(Response::success(
                Some(id),
                serde_json::json!({ "tools": tools::descriptors() }),
            )),
            "tools/call" => {
                // The connection credential is re-verified on every call, so
                // a token invalidated mid-connection stops working.
                if !self.gatekeeper.verify(presented) {
                    *auth_failures += 1;
                    return Some(Response::failure(
                        Some(id),
                        CompanionError::AuthenticationFailed.to_rpc_error(),
                    ));
                }

                let params: ToolCallParams = match serde_json::from_value(
                    request.params.unwrap_or(serde_json::Value::Null),
                ) {
                    Ok(params) => params,
                    Err(e) => {
                        return Some(Response::failure(
                            Some(id),
                            CompanionError::InvalidArguments(e.to_string()).to_rpc_error(),
                        ));
                    }
                };

                let tool_call_id = Some(id.to_string());
                match self
                    .router
                    .call(&params.name, params.arguments, tool_call_id)
                    .await
                {
                    Ok(result) => Some(Response::success(Some(id), result)),
                    Err(e) => Some(Response::failure(Some(id), e.to_rpc_error())),
                }
            }
            other => Some(Response::failure(
                Some(id),
                CompanionError::ToolNotFound(other.to_string()).to_rpc_error(),
            )),
        }
    }
}

fn initialize_response(request: &Request) -> Response {
    let params: Result<InitializeParams, _> =
        serde_json::from_value(request.params.clone().unwrap_or(serde_json::Value::Null));
    match params {
        Ok(params) => {
            info!(
                "client {} v{} connected (protocol {})",
                params.client_info.name, params.client_info.version, params.protocol_version
            );
            let result = InitializeResult {
                protocol_version: constants::PROTOCOL_VERSION.to_string(),
                server_info: PeerInfo {
                    name: "colloquy-companion".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                capabilities: ServerCapabilities::default(),
            };
            match serde_json::to_value(result) {
                Ok(value) => Response::success(request.id.clone(), value),
                Err(e) => Response::failure(
                    request.id.clone(),
                    CompanionError::Internal(e.to_string()).to_rpc_error(),
                ),
            }
        }
        Err(e) => Response::failure(
            request.id.clone(),
            CompanionError::ProtocolError(format!("malformed initialize params: {e}"))
                .to_rpc_error(),
        ),
    }
}

fn notification_for(event: &ResolutionEvent) -> Notification {
    let method = match event.status {
        ResolutionStatus::Accepted => "ide/diffAccepted",
        ResolutionStatus::Rejected => "ide/diffRejected",
        ResolutionStatus::Closed => "ide/diffClosed",
    };
    Notification::new(
        method,
        serde_json::json!({
            "filePath": event.file_path,
            "sessionId": event.session_id,
            "content": event.content,
        }),
    )
}

async fn read_line_with_timeout(
    reader: &mut BufReader<OwnedReadHalf>,
    window: Duration,
) -> anyhow::Result<Option<String>> {
    let mut line = String::new();
    let n = tokio::time::timeout(window, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow::anyhow!("handshake timed out"))?
        .context("handshake read failed")?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

async fn write_json<T: serde::Serialize>(
    write_half: &mut OwnedWriteHalf,
    value: &T,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(value).context("failed to serialize outgoing message")?;
    write_half.write_all(json.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}
