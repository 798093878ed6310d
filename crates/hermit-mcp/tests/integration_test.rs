//! Integration tests for the Hermit MCP server.
//!
//! These spawn the real server binary against a temporary workspace and
//! talk JSON-RPC to it over stdio.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

/// The server process plus its workspace
struct McpServerProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    root: TempDir,
    next_id: u64,
}

impl McpServerProcess {
    fn spawn() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let mut child = Command::new(env!("CARGO_BIN_EXE_hermit-mcp"))
            .arg("--root")
            .arg(root.path())
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn hermit-mcp");
        let stdout = BufReader::new(child.stdout.take().expect("stdout not captured"));
        Self {
            child,
            stdout,
            root,
            next_id: 1,
        }
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }));

        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).expect("read response");
            assert!(n > 0, "server closed stdout");
            let message: Value = serde_json::from_str(&line)
                .unwrap_or_else(|e| panic!("parse response '{}': {}", line.trim(), e));
            if message["id"] == id {
                return message;
            }
        }
    }

    /// Send a notification (no response expected)
    fn notify(&mut self, method: &str) {
        self.send(json!({ "jsonrpc": "2.0", "method": method }));
    }

    fn send(&mut self, message: Value) {
        let stdin = self.child.stdin.as_mut().expect("stdin not captured");
        writeln!(stdin, "{}", message).expect("write message");
        stdin.flush().expect("flush stdin");
    }

    fn initialize(&mut self) -> Value {
        let response = self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "hermit-mcp-test", "version": "0.1.0" }
            }),
        );
        assert!(
            response.get("result").is_some(),
            "Expected result in initialize response, got: {}",
            response
        );
        self.notify("notifications/initialized");
        std::thread::sleep(Duration::from_millis(50));
        response
    }

    fn call(&mut self, tool: &str, arguments: Value) -> Value {
        let response = self.request(
            "tools/call",
            json!({ "name": tool, "arguments": arguments }),
        );
        response
            .get("result")
            .cloned()
            .unwrap_or_else(|| panic!("Expected result, got: {}", response))
    }
}

impl Drop for McpServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn text(result: &Value) -> &str {
    result["content"][0]["text"].as_str().unwrap_or_default()
}

fn is_error(result: &Value) -> bool {
    result["isError"].as_bool().unwrap_or(false)
}

#[test]
fn test_mcp_initialize() {
    let mut server = McpServerProcess::spawn();
    let response = server.initialize();
    let result = &response["result"];
    assert!(result.get("serverInfo").is_some());
    assert!(result["capabilities"].get("tools").is_some());
}

#[test]
fn test_mcp_list_tools() {
    let mut server = McpServerProcess::spawn();
    server.initialize();
    let response = server.request("tools/list", json!({}));
    let tools = response["result"]["tools"].as_array().expect("tools array");
    let names: Vec<_> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
    assert_eq!(
        names,
        ["run_command", "read_file", "write_file", "delete_file", "list_dir"]
    );
    let run = &tools[0];
    assert!(run["inputSchema"]["properties"].get("command").is_some());
}

#[test]
fn test_mcp_run_command() {
    let mut server = McpServerProcess::spawn();
    server.initialize();
    let result = server.call("run_command", json!({ "command": "echo hi" }));
    assert!(!is_error(&result), "{}", result);
    assert_eq!(text(&result), "hi\n");

    let result = server.call("run_command", json!({ "command": "exit 7" }));
    assert!(is_error(&result));
    assert!(text(&result).contains("exit code: 7"));
}

#[test]
fn test_mcp_file_tools() {
    let mut server = McpServerProcess::spawn();
    server.initialize();

    let result = server.call(
        "write_file",
        json!({ "path": "/workspace/notes/todo.txt", "content": "ship it\n" }),
    );
    assert!(!is_error(&result), "{}", result);
    assert_eq!(
        std::fs::read_to_string(server.root.path().join("notes/todo.txt")).unwrap(),
        "ship it\n"
    );

    let result = server.call("read_file", json!({ "path": "notes/todo.txt" }));
    assert_eq!(text(&result), "ship it\n");

    let result = server.call("list_dir", json!({ "path": "notes" }));
    let entries: Value = serde_json::from_str(text(&result)).unwrap();
    assert_eq!(entries[0]["name"], "todo.txt");
    assert_eq!(entries[0]["path"], "/workspace/notes/todo.txt");

    let result = server.call("delete_file", json!({ "path": "notes" }));
    assert!(!is_error(&result));
    assert!(!server.root.path().join("notes").exists());
    let result = server.call("delete_file", json!({ "path": "notes" }));
    assert!(!is_error(&result));
}

#[test]
fn test_mcp_paths_are_confined() {
    let mut server = McpServerProcess::spawn();
    server.initialize();

    let result = server.call(
        "write_file",
        json!({ "path": "../outside.txt", "content": "x" }),
    );
    assert!(is_error(&result));
    assert!(text(&result).starts_with("path_traversal"));
    assert!(!server.root.path().parent().unwrap().join("outside.txt").exists());

    let result = server.call("read_file", json!({ "path": "/etc/passwd" }));
    assert!(is_error(&result));
}

#[test]
fn test_mcp_unknown_tool() {
    let mut server = McpServerProcess::spawn();
    server.initialize();
    let response = server.request(
        "tools/call",
        json!({ "name": "teleport", "arguments": {} }),
    );
    assert!(response.get("error").is_some(), "{}", response);
}
