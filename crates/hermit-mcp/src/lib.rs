//! Hermit MCP Server
//!
//! Exposes one local workspace to MCP clients: shell commands and file
//! operations, with the same limits and path rules as the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use hermit::{
    ExecutionRequest, ExecutionResult, FileStore, InMemoryStore, SandboxError, SandboxExecutor,
    Store, Workspace,
};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    schemars::{self, JsonSchema},
    service::{RequestContext, RoleServer},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Parameters for `run_command`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCommandParams {
    /// The shell command or script to run with `sh -c`.
    pub command: String,

    /// Working directory inside the workspace (default: the workspace root)
    #[serde(default)]
    pub cwd: Option<String>,

    /// Wall-clock timeout in milliseconds (default: 30000, capped at 300000)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Parameters for tools that take a single path
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathParams {
    /// Path inside the workspace, absolute (`/workspace/...`) or relative to it.
    #[serde(default)]
    pub path: String,
}

/// Parameters for `write_file`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteFileParams {
    /// Path inside the workspace.
    pub path: String,
    /// Full new file content.
    pub content: String,
}

/// MCP server bound to one workspace
#[derive(Clone)]
pub struct HermitServer {
    executor: Arc<SandboxExecutor>,
    files: FileStore,
    workspace: Workspace,
}

impl std::fmt::Debug for HermitServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HermitServer")
            .field("workspace", &self.workspace.id)
            .finish_non_exhaustive()
    }
}

impl HermitServer {
    /// Serve `workspace`, which must be ready.
    pub fn new(config: &hermit::HermitConfig, workspace: Workspace) -> Self {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let guest_root = &config.sandbox.guest_root;
        let executor = SandboxExecutor::new(config.launcher(), store, guest_root)
            .with_term_grace(config.sandbox.term_grace);
        Self {
            executor: Arc::new(executor),
            files: FileStore::new(guest_root),
            workspace,
        }
    }

    async fn run_command(&self, params: RunCommandParams) -> Result<CallToolResult, McpError> {
        let mut request = ExecutionRequest::new(params.command);
        request.cwd = params.cwd;
        request.timeout = params.timeout_ms.map(Duration::from_millis);

        let result = match self
            .executor
            .execute(&self.workspace, request, None, &CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(e) => return Ok(tool_error(&e)),
        };

        let output = render_execution(&result);
        let content = vec![Content::text(output)];
        Ok(if result.success() {
            CallToolResult::success(content)
        } else {
            CallToolResult::error(content)
        })
    }

    async fn read_file(&self, params: PathParams) -> Result<CallToolResult, McpError> {
        match self.files.read(&self.workspace, &params.path).await {
            Ok(bytes) => Ok(CallToolResult::success(vec![Content::text(
                String::from_utf8_lossy(&bytes).into_owned(),
            )])),
            Err(e) => Ok(tool_error(&e)),
        }
    }

    async fn write_file(&self, params: WriteFileParams) -> Result<CallToolResult, McpError> {
        match self
            .files
            .write(&self.workspace, &params.path, params.content.as_bytes())
            .await
        {
            Ok(n) => Ok(CallToolResult::success(vec![Content::text(format!(
                "wrote {n} bytes to {}",
                params.path
            ))])),
            Err(e) => Ok(tool_error(&e)),
        }
    }

    async fn delete_file(&self, params: PathParams) -> Result<CallToolResult, McpError> {
        match self.files.delete(&self.workspace, &params.path).await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(format!(
                "deleted {}",
                params.path
            ))])),
            Err(e) => Ok(tool_error(&e)),
        }
    }

    async fn list_dir(&self, params: PathParams) -> Result<CallToolResult, McpError> {
        match self.files.list(&self.workspace, &params.path).await {
            Ok(entries) => {
                let listing = serde_json::to_string_pretty(&entries)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(listing)]))
            }
            Err(e) => Ok(tool_error(&e)),
        }
    }

    fn tools(&self) -> Vec<Tool> {
        vec![
            tool::<RunCommandParams>(
                "run_command",
                "Run Shell Command",
                "Run a shell command in the workspace with `sh -c`. The working directory \
                defaults to the workspace root. Commands are killed at their timeout; \
                output is capped.",
            ),
            tool::<PathParams>(
                "read_file",
                "Read File",
                "Read a file from the workspace as text.",
            ),
            tool::<WriteFileParams>(
                "write_file",
                "Write File",
                "Create or replace a file in the workspace. Parent directories are created.",
            ),
            tool::<PathParams>(
                "delete_file",
                "Delete File",
                "Delete a file or directory tree. Deleting a missing path succeeds.",
            ),
            tool::<PathParams>(
                "list_dir",
                "List Directory",
                "List a directory as JSON entries sorted by name.",
            ),
        ]
    }
}

fn tool<P: JsonSchema>(
    name: &'static str,
    title: &'static str,
    description: &'static str,
) -> Tool {
    let schema = schemars::schema_for!(P);
    let schema_json = serde_json::to_value(schema).unwrap_or_default();
    let input_schema = match schema_json {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    };

    Tool {
        name: name.into(),
        title: Some(title.into()),
        description: Some(description.into()),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

fn tool_error(error: &SandboxError) -> CallToolResult {
    tracing::debug!(kind = %error.kind(), "tool call failed: {}", error);
    let public = error.to_public();
    CallToolResult::error(vec![Content::text(format!(
        "{}: {}",
        public.kind, public.message
    ))])
}

fn params<P: DeserializeOwned>(request: &CallToolRequestParam) -> Result<P, McpError> {
    let args = request
        .arguments
        .clone()
        .ok_or_else(|| McpError::invalid_params("Missing parameters", None))?;
    serde_json::from_value(serde_json::Value::Object(args))
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e), None))
}

impl ServerHandler for HermitServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Hermit gives you one workspace directory, visible as /workspace. Use \
                'run_command' to run shell commands there and 'read_file', 'write_file', \
                'delete_file' and 'list_dir' for files. Paths outside /workspace are refused."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            "run_command" => self.run_command(params(&request)?).await,
            "read_file" => self.read_file(params(&request)?).await,
            "write_file" => self.write_file(params(&request)?).await,
            "delete_file" => self.delete_file(params(&request)?).await,
            "list_dir" => {
                let params = match request.arguments {
                    Some(_) => params(&request)?,
                    None => PathParams {
                        path: String::new(),
                    },
                };
                self.list_dir(params).await
            }
            _ => Err(McpError::invalid_params(
                format!("Unknown tool: {}", request.name),
                None,
            )),
        }
    }
}

/// Text shown to the model for a finished command: stdout, then stderr
/// under a divider, then a status note when the run did not succeed.
fn render_execution(result: &ExecutionResult) -> String {
    let stdout = result.stdout_str();
    let stderr = result.stderr_str();
    let body = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n--- stderr ---\n{stderr}"),
        (false, true) => stdout,
        (true, _) => stderr,
    };

    let status = if result.timed_out {
        Some(format!("timed out after {} ms", result.duration.as_millis()))
    } else if result.cancelled {
        Some("cancelled".to_string())
    } else if result.exit_code != 0 || body.is_empty() {
        Some(format!("exit code: {}", result.exit_code))
    } else {
        None
    };

    let mut text = match status {
        Some(status) if body.is_empty() => format!("(no output, {status})"),
        Some(status) => format!("{body}\n({status})"),
        None => body,
    };
    if result.truncated {
        text.push_str("\n[output truncated]");
    }
    text
}
