//! Workspaces, their owners and identifiers.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::ResourceLimits;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifies one workspace sandbox.
    WorkspaceId
);
id_type!(
    /// Identifies one agent run.
    TaskId
);

/// Owner id of workspaces created with [`Workspace::local`].
pub const LOCAL_OWNER: &str = "local";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user id.
    pub id: String,
}

impl Principal {
    /// Create a principal for the given user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Lifecycle of a workspace sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Root directory is being prepared.
    Provisioning,
    /// Accepting commands and file operations.
    Ready,
    /// Destroyed; nothing runs here again.
    Terminated,
}

/// Per-workspace configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Resource limits for commands and file operations.
    pub limits: ResourceLimits,
    /// When set, only these binaries (glob patterns) may be invoked.
    pub allowed_binaries: Option<Vec<String>>,
    /// How many commands may run at once. Extra callers get `SandboxBusy`.
    pub concurrent_commands: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            allowed_binaries: None,
            concurrent_commands: 4,
        }
    }
}

/// One isolated, owned execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Workspace id.
    pub id: WorkspaceId,
    /// Owning principal id. Never shared.
    pub owner_id: String,
    /// Host directory backing the guest root.
    pub root: PathBuf,
    /// Lifecycle state.
    pub status: WorkspaceStatus,
    /// Limits and restrictions.
    pub config: WorkspaceConfig,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// A fresh workspace backed by `root`, still provisioning.
    pub fn new(
        owner_id: impl Into<String>,
        root: impl Into<PathBuf>,
        config: WorkspaceConfig,
    ) -> Self {
        Self {
            id: WorkspaceId::new(),
            owner_id: owner_id.into(),
            root: root.into(),
            status: WorkspaceStatus::Provisioning,
            config,
            created_at: Utc::now(),
        }
    }

    /// An existing directory used directly as a ready workspace, for local
    /// single-user tools.
    pub fn local(root: impl Into<PathBuf>, config: WorkspaceConfig) -> Self {
        let mut workspace = Self::new(LOCAL_OWNER, root, config);
        workspace.status = WorkspaceStatus::Ready;
        workspace
    }

    /// Whether `principal` owns this workspace.
    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        self.owner_id == principal.id
    }

    /// Whether commands and file operations may run.
    pub fn is_ready(&self) -> bool {
        self.status == WorkspaceStatus::Ready
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip_through_strings() {
        let id = WorkspaceId::new();
        let parsed: WorkspaceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_ownership() {
        let ws = Workspace {
            id: WorkspaceId::new(),
            owner_id: "alice".into(),
            root: PathBuf::from("/tmp/ws"),
            status: WorkspaceStatus::Ready,
            config: WorkspaceConfig::default(),
            created_at: Utc::now(),
        };
        assert!(ws.is_owned_by(&Principal::new("alice")));
        assert!(!ws.is_owned_by(&Principal::new("mallory")));
        assert!(ws.is_ready());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let cfg: WorkspaceConfig =
            serde_json::from_str(r#"{"allowed_binaries": ["ls", "git"]}"#).unwrap();
        assert_eq!(cfg.concurrent_commands, 4);
        assert_eq!(cfg.allowed_binaries.unwrap().len(), 2);
    }
}
