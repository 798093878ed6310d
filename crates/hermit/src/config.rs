//! File-based configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local setup. Durations are written in milliseconds.
//!
//! ```toml
//! [sandbox]
//! data_dir = "/var/lib/hermit"
//! launcher = "bubblewrap"
//! concurrent_commands = 2
//!
//! [sandbox.limits]
//! timeout = 10000
//!
//! [agent]
//! autonomous_max_iterations = 25
//!
//! [server.tokens]
//! "s3cret" = "alice"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{AgentConfig, AgentLimitsConfig};
use crate::executor::{BubblewrapLauncher, DEFAULT_ENV_ALLOWLIST, HostLauncher, Launcher};
use crate::limits::{ResourceLimits, duration_ms, opt_duration_ms};
use crate::stream::BrokerConfig;
use crate::workspace::WorkspaceConfig;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Values parsed but do not make sense together.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which [`Launcher`] runs commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// `sh -c` directly on the host.
    #[default]
    Host,
    /// Inside a bubblewrap namespace sandbox.
    Bubblewrap,
}

/// `[sandbox]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Directory under which workspace roots are created.
    pub data_dir: PathBuf,
    /// Absolute path commands and callers see as the workspace root.
    pub guest_root: PathBuf,
    /// How commands are launched.
    pub launcher: LauncherKind,
    /// Let bubblewrap sandboxes reach the network.
    pub share_net: bool,
    /// Commands allowed to run at once per workspace.
    pub concurrent_commands: usize,
    /// Default resource limits for new workspaces.
    pub limits: ResourceLimits,
    /// Environment variables passed through to commands.
    pub env_allowlist: Vec<String>,
    /// Time between SIGTERM and SIGKILL when a command is stopped.
    #[serde(with = "duration_ms")]
    pub term_grace: Duration,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("hermit"),
            guest_root: PathBuf::from("/workspace"),
            launcher: LauncherKind::Host,
            share_net: false,
            concurrent_commands: 4,
            limits: ResourceLimits::default(),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            term_grace: Duration::from_secs(1),
        }
    }
}

/// `[agent]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Iteration ceiling for interactive runs.
    pub interactive_max_iterations: u32,
    /// Upper bound for autonomous iteration ceilings.
    pub autonomous_max_iterations: u32,
    /// Wall-clock ceiling for interactive runs; absent or 0 means none.
    #[serde(with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub interactive_max_wall_time: Option<Duration>,
    /// Wall-clock ceiling for autonomous runs; 0 means none.
    #[serde(with = "opt_duration_ms", skip_serializing_if = "Option::is_none")]
    pub autonomous_max_wall_time: Option<Duration>,
    /// How long one decision may take.
    #[serde(with = "duration_ms")]
    pub decision_timeout: Duration,
    /// Narration batch size for autonomous runs.
    pub narration_batch: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        let limits = AgentLimitsConfig::default();
        let agent = AgentConfig::default();
        Self {
            interactive_max_iterations: limits.interactive_max_iterations,
            autonomous_max_iterations: limits.autonomous_max_iterations,
            interactive_max_wall_time: limits.interactive_max_wall_time,
            autonomous_max_wall_time: limits.autonomous_max_wall_time,
            decision_timeout: agent.decision_timeout,
            narration_batch: agent.narration_batch,
        }
    }
}

/// `[stream]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Heartbeat interval on long-lived channels.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// How often workspace subscriptions poll the store.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Buffered events per channel.
    pub capacity: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            heartbeat_interval: broker.heartbeat_interval,
            poll_interval: Duration::from_millis(250),
            capacity: broker.capacity,
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the HTTP API binds to.
    pub listen: SocketAddr,
    /// Bearer token → principal id.
    pub tokens: HashMap<String, String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8088)),
            tokens: HashMap::new(),
        }
    }
}

/// `[decision]`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionSection {
    /// Endpoint of the HTTP decision collaborator.
    pub url: Option<String>,
    /// Model id forwarded with each request.
    pub model: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HermitConfig {
    /// Sandbox and execution.
    pub sandbox: SandboxSection,
    /// Agent loop.
    pub agent: AgentSection,
    /// Event channels.
    pub stream: StreamSection,
    /// HTTP API.
    pub server: ServerSection,
    /// Decision collaborator.
    pub decision: DecisionSection,
}

impl HermitConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load from `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.sandbox.guest_root.is_absolute() {
            return Err(ConfigError::Invalid(
                "sandbox.guest_root must be an absolute path".into(),
            ));
        }
        if self.sandbox.concurrent_commands == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.concurrent_commands must be at least 1".into(),
            ));
        }
        if self.sandbox.limits.timeout > self.sandbox.limits.max_timeout {
            return Err(ConfigError::Invalid(
                "sandbox.limits.timeout exceeds sandbox.limits.max_timeout".into(),
            ));
        }
        Ok(())
    }

    /// The launcher selected by `[sandbox]`.
    pub fn launcher(&self) -> Arc<dyn Launcher> {
        let env = self.sandbox.env_allowlist.clone();
        match self.sandbox.launcher {
            LauncherKind::Host => Arc::new(HostLauncher::new().with_env_allowlist(env)),
            LauncherKind::Bubblewrap => Arc::new(
                BubblewrapLauncher::new()
                    .with_network(self.sandbox.share_net)
                    .with_env_allowlist(env),
            ),
        }
    }

    /// Configuration for new workspaces.
    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            limits: self.sandbox.limits.clone(),
            allowed_binaries: None,
            concurrent_commands: self.sandbox.concurrent_commands,
        }
    }

    /// Agent loop settings.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            limits: AgentLimitsConfig {
                interactive_max_iterations: self.agent.interactive_max_iterations,
                autonomous_max_iterations: self.agent.autonomous_max_iterations,
                interactive_max_wall_time: self
                    .agent
                    .interactive_max_wall_time
                    .filter(|d| !d.is_zero()),
                autonomous_max_wall_time: self
                    .agent
                    .autonomous_max_wall_time
                    .filter(|d| !d.is_zero()),
            },
            decision_timeout: self.agent.decision_timeout,
            narration_batch: self.agent.narration_batch,
        }
    }

    /// Event channel settings.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            heartbeat_interval: self.stream.heartbeat_interval,
            capacity: self.stream.capacity,
        }
    }
}
