//! End-to-end tests of the companion server over its loopback transport
//!
//! A minimal test client speaks the wire protocol directly: credential
//! control line, `initialize` handshake, then line-delimited JSON-RPC.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use colloquy_companion::{
    CompanionServer, DiscoveryStore, EditorHandle, SessionState, WorkspaceEditor,
};

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: i64,
}

impl TestClient {
    async fn connect(port: u16, token: &str) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 0,
        };
        client.send_raw(&format!("#authorization:{token}")).await;
        client
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line from the server, or `None` on a closed connection.
    async fn read_json(&mut self) -> Option<serde_json::Value> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for the server")
                .unwrap();
            if n == 0 {
                return None;
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(text).unwrap());
        }
    }

    async fn read_response(&mut self, id: i64) -> serde_json::Value {
        loop {
            let value = self.read_json().await.expect("connection closed early");
            if value.get("id").and_then(|v| v.as_i64()) == Some(id) {
                return value;
            }
        }
    }

    async fn read_notification(&mut self, method: &str) -> serde_json::Value {
        loop {
            let value = self.read_json().await.expect("connection closed early");
            if value.get("method").and_then(|v| v.as_str()) == Some(method) {
                return value;
            }
        }
    }

    async fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id;
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.send_raw(&serde_json::to_string(&request).unwrap()).await;
        self.read_response(id).await
    }

    async fn initialize(&mut self) -> serde_json::Value {
        self.request(
            "initialize",
            serde_json::json!({
                "protocolVersion": "1.0",
                "clientInfo": { "name": "test-client", "version": "0.0.0" },
                "capabilities": {},
            }),
        )
        .await
    }

    async fn call(&mut self, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        self.request(
            "tools/call",
            serde_json::json!({ "name": name, "arguments": arguments }),
        )
        .await
    }
}

struct Harness {
    discovery_dir: tempfile::TempDir,
    workspace: tempfile::TempDir,
    editor: WorkspaceEditor,
    server: Arc<CompanionServer>,
    token: String,
}

impl Harness {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let discovery_dir = tempfile::TempDir::new().unwrap();
        let workspace = tempfile::TempDir::new().unwrap();
        let store = DiscoveryStore::new(discovery_dir.path());
        let editor = WorkspaceEditor::new();

        let server = CompanionServer::bind(
            store,
            EditorHandle::new(editor.clone()),
            vec![workspace.path().to_path_buf()],
        )
        .await
        .unwrap();
        let token = server.instance().token.as_str().to_string();

        let server = Arc::new(server);
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        Self {
            discovery_dir,
            workspace,
            editor,
            server,
            token,
        }
    }

    async fn client(&self) -> TestClient {
        let mut client = TestClient::connect(self.server.port(), &self.token).await;
        let response = client.initialize().await;
        assert!(response.get("error").is_none(), "handshake failed: {response}");
        client
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.workspace.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

#[tokio::test]
async fn handshake_reports_capabilities_and_tools() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(harness.server.port(), &harness.token).await;

    let response = client.initialize().await;
    let result = &response["result"];
    assert_eq!(result["serverInfo"]["name"], "colloquy-companion");
    assert!(result["capabilities"]["tools"].is_object());

    let listed = client.request("tools/list", serde_json::json!({})).await;
    let tools = listed["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["openDiff", "closeDiff", "navigateTo"]);
    for tool in tools {
        assert!(tool["inputSchema"].is_object());
    }
}

#[tokio::test]
async fn bad_credential_closes_the_connection_silently() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(harness.server.port(), "wrong-token").await;

    // No error payload that would confirm the server exists; just EOF.
    assert!(client.read_json().await.is_none());
}

#[tokio::test]
async fn tool_calls_before_initialize_are_rejected() {
    let harness = Harness::start().await;
    let mut client = TestClient::connect(harness.server.port(), &harness.token).await;

    let request = serde_json::json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {},
    });
    client.send_raw(&serde_json::to_string(&request).unwrap()).await;

    let response = client.read_json().await.expect("expected an error response");
    assert_eq!(response["error"]["code"], -32600);
    // Connection is closed afterwards.
    assert!(client.read_json().await.is_none());
}

#[tokio::test]
async fn open_diff_then_accept_applies_content_and_notifies() {
    let harness = Harness::start().await;
    let path = harness.file("a.py", "print(1)\nprint(2)\n");
    let mut client = harness.client().await;

    let response = client
        .call(
            "openDiff",
            serde_json::json!({
                "filePath": path,
                "proposedContent": "print(1)\nprint(3)\n",
                "explanation": "swap 2 for 3",
            }),
        )
        .await;
    let session_id = response["result"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(response["result"]["status"], "proposed");

    // Decorations are rendered with controls at both ends of the change.
    let decorations = harness.editor.decorations_for(&path).unwrap();
    assert!(!decorations.regions.is_empty());

    // The user accepts through the editor-facing API.
    harness
        .server
        .registry()
        .resolve(path.clone(), true)
        .await
        .unwrap();

    let notification = client.read_notification("ide/diffAccepted").await;
    assert_eq!(notification["params"]["sessionId"].as_str().unwrap(), session_id);
    assert_eq!(
        notification["params"]["content"].as_str().unwrap(),
        "print(1)\nprint(3)\n"
    );
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "print(1)\nprint(3)\n"
    );
}

#[tokio::test]
async fn second_open_diff_supersedes_the_first() {
    let harness = Harness::start().await;
    let path = harness.file("a.py", "print(1)\nprint(2)\n");
    let mut client = harness.client().await;

    let first = client
        .call(
            "openDiff",
            serde_json::json!({ "filePath": path, "proposedContent": "print(1)\nprint(3)\n" }),
        )
        .await;
    let first_id: uuid::Uuid = first["result"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let second = client
        .call(
            "openDiff",
            serde_json::json!({ "filePath": path, "proposedContent": "print(1)\nprint(4)\n" }),
        )
        .await;
    let second_id: uuid::Uuid = second["result"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let registry = harness.server.registry();
    assert_eq!(
        registry.session(first_id).await.unwrap().state,
        SessionState::Superseded
    );
    let current = registry.proposed_for(&path).await.unwrap();
    assert_eq!(current.session_id, second_id);
    assert_eq!(current.state, SessionState::Proposed);
}

#[tokio::test]
async fn close_diff_without_a_session_is_a_state_conflict() {
    let harness = Harness::start().await;
    let path = harness.workspace.path().join("a.py");
    let mut client = harness.client().await;

    let response = client
        .call("closeDiff", serde_json::json!({ "filePath": path }))
        .await;
    assert_eq!(response["error"]["code"], -32000);
}

#[tokio::test]
async fn close_diff_retracts_and_notifies() {
    let harness = Harness::start().await;
    let path = harness.file("a.py", "print(1)\n");
    let mut client = harness.client().await;

    client
        .call(
            "openDiff",
            serde_json::json!({ "filePath": path, "proposedContent": "print(2)\n" }),
        )
        .await;
    let response = client
        .call("closeDiff", serde_json::json!({ "filePath": path }))
        .await;
    assert_eq!(response["result"]["status"], "closed");

    let notification = client.read_notification("ide/diffClosed").await;
    assert_eq!(
        notification["params"]["filePath"].as_str().unwrap(),
        path.to_str().unwrap()
    );
    assert!(harness.editor.decorations_for(&path).is_none());
}

#[tokio::test]
async fn navigate_to_clamps_out_of_range_positions() {
    let harness = Harness::start().await;
    let path = harness.file("notes.txt", "alpha\nbeta\n");
    let mut client = harness.client().await;

    let response = client
        .call(
            "navigateTo",
            serde_json::json!({ "filePath": path, "line": 99, "character": 99 }),
        )
        .await;
    assert_eq!(response["result"]["line"], 2);
    assert_eq!(response["result"]["character"], 5);
}

#[tokio::test]
async fn out_of_scope_paths_are_refused() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let response = client
        .call(
            "openDiff",
            serde_json::json!({ "filePath": "/etc/passwd", "proposedContent": "oops" }),
        )
        .await;
    assert_eq!(response["error"]["code"], -32001);
}

#[tokio::test]
async fn unknown_tools_and_methods_report_method_not_found() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let response = client
        .call("formatDocument", serde_json::json!({}))
        .await;
    assert_eq!(response["error"]["code"], -32601);

    let response = client.request("resources/list", serde_json::json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn malformed_arguments_identify_the_field() {
    let harness = Harness::start().await;
    let mut client = harness.client().await;

    let response = client
        .call("openDiff", serde_json::json!({ "proposedContent": "x" }))
        .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(
        response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("filePath")
    );
}

#[tokio::test]
async fn blocking_open_diff_returns_the_resolution() {
    let harness = Harness::start().await;
    let path = harness.file("a.py", "print(1)\n");
    let mut client = harness.client().await;

    // Resolve from "the editor" once the session shows up.
    let registry = harness.server.registry().clone();
    let resolve_path = path.clone();
    tokio::spawn(async move {
        loop {
            if registry.proposed_for(&resolve_path).await.is_some() {
                registry.resolve(resolve_path, true).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let response = client
        .call(
            "openDiff",
            serde_json::json!({
                "filePath": path,
                "proposedContent": "print(2)\n",
                "blocking": true,
            }),
        )
        .await;
    assert_eq!(response["result"]["status"], "accepted");
    assert_eq!(response["result"]["content"], "print(2)\n");
}

#[tokio::test]
async fn discovery_record_lives_and_dies_with_the_server() {
    let harness = Harness::start().await;
    let store = DiscoveryStore::new(harness.discovery_dir.path());

    let records = store.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].port, harness.server.port());
    assert_eq!(records[0].token, harness.token);
    assert!(records[0].workspace_roots.contains(&harness.workspace.path().to_path_buf()));

    // Shutdown deregisters before the port is released.
    harness.server.shutdown();
    assert!(store.list().is_empty());
}
