//! Hermit: per-workspace sandbox execution for coding agents
//!
//! Every workspace is an isolated directory, exposed to callers and commands
//! under a fixed guest root (`/workspace`). Hermit runs shell commands in it
//! with enforced limits, reads and writes its files without ever escaping the
//! root, streams output and agent progress as ordered events, and drives an
//! agent loop that plans through an external decision collaborator.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hermit::agent::ScriptedDecider;
//! use hermit::{ExecutionRequest, Hermit, HermitConfig, InMemoryStore, Principal};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), hermit::SandboxError> {
//! let hermit = Hermit::new(
//!     &HermitConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(ScriptedDecider::default()),
//! );
//! let alice = Principal::new("alice");
//! let ws = hermit.create_workspace(&alice, None).await?;
//! let result = hermit
//!     .run_command(&alice, ws.id, ExecutionRequest::new("echo hi"), &CancellationToken::new())
//!     .await?;
//! assert_eq!(result.stdout_str(), "hi\n");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod auth;
pub mod config;
mod error;
mod event;
pub mod executor;
mod fs;
mod limits;
pub mod path_guard;
pub mod policy;
mod service;
mod store;
pub mod stream;
mod workspace;

pub use auth::{Authenticator, TokenAuthenticator};
pub use config::{ConfigError, HermitConfig};
pub use error::{
    DecisionError, ErrorKind, PersistenceError, PublicError, SandboxError, log_safe,
};
pub use event::{AgentUpdate, RecordedUpdate, SourceKind, StreamEvent};
pub use executor::{ExecutionRequest, ExecutionResult, SandboxExecutor};
pub use fs::{
    BatchItemResult, BatchResult, DirEntry, FileAction, FileOpOutput, FileOperation, FileStat,
    FileStore,
};
pub use limits::ResourceLimits;
pub use path_guard::{PathGuard, SafePath};
pub use service::{AgentRequest, Hermit};
pub use store::{InMemoryStore, ShellCommandRecord, Store};
pub use stream::{EventChannel, StreamBroker};
pub use workspace::{
    LOCAL_OWNER, Principal, TaskId, Workspace, WorkspaceConfig, WorkspaceId, WorkspaceStatus,
};
