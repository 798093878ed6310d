//! How a script is turned into a process for a workspace.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::SandboxError;
use crate::path_guard::{PathGuard, SafePath};

/// Environment variables passed through to commands by default.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "LANG", "LC_ALL", "TERM", "TZ"];

/// Builds the process that runs one script inside a workspace.
///
/// Implementations only configure the command; spawning, process-group
/// handling, resource limits and output capture belong to the executor.
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Short identifier, used in logs.
    fn name(&self) -> &'static str;

    /// Build the command that runs `script` with `cwd` as working directory.
    fn command(
        &self,
        guard: &PathGuard,
        cwd: &SafePath,
        script: &str,
    ) -> Result<Command, SandboxError>;
}

fn passthrough_env(allowlist: &[String]) -> Vec<(String, OsString)> {
    allowlist
        .iter()
        .filter_map(|key| std::env::var_os(key).map(|value| (key.clone(), value)))
        .collect()
}

/// Runs scripts directly on the host with `sh -c`, in the workspace's
/// backing directory and with a scrubbed environment.
///
/// Paths are confined by the file API only; the process itself can see the
/// host. Use [`BubblewrapLauncher`] for untrusted callers.
#[derive(Debug, Clone)]
pub struct HostLauncher {
    shell: PathBuf,
    env_allowlist: Vec<String>,
}

impl Default for HostLauncher {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl HostLauncher {
    /// Create a host launcher with the default shell and environment allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the environment allow-list.
    pub fn with_env_allowlist(mut self, keys: Vec<String>) -> Self {
        self.env_allowlist = keys;
        self
    }
}

impl Launcher for HostLauncher {
    fn name(&self) -> &'static str {
        "host"
    }

    fn command(
        &self,
        guard: &PathGuard,
        cwd: &SafePath,
        script: &str,
    ) -> Result<Command, SandboxError> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(script)
            .current_dir(&cwd.host)
            .env_clear()
            .envs(passthrough_env(&self.env_allowlist))
            .env("HOME", guard.host_root())
            .env("PWD", &cwd.host);
        Ok(command)
    }
}

/// Runs scripts inside a bubblewrap sandbox.
///
/// The workspace's host directory is bound read-write at the guest root; a
/// small set of system directories is bound read-only; every namespace is
/// unshared (network optionally kept).
#[derive(Debug, Clone)]
pub struct BubblewrapLauncher {
    bwrap: PathBuf,
    share_net: bool,
    env_allowlist: Vec<String>,
}

const READ_ONLY_SYSTEM_DIRS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib64", "/lib32", "/etc",
];

impl Default for BubblewrapLauncher {
    fn default() -> Self {
        Self {
            bwrap: PathBuf::from("bwrap"),
            share_net: false,
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BubblewrapLauncher {
    /// Create a launcher using `bwrap` from `PATH`, without network access.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the host network namespace.
    pub fn with_network(mut self, share_net: bool) -> Self {
        self.share_net = share_net;
        self
    }

    /// Replace the environment allow-list.
    pub fn with_env_allowlist(mut self, keys: Vec<String>) -> Self {
        self.env_allowlist = keys;
        self
    }

    /// The full bwrap argument list, without the program itself.
    pub fn args(&self, guard: &PathGuard, cwd: &SafePath, script: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |parts: &[&dyn AsRef<std::ffi::OsStr>]| {
            args.extend(parts.iter().map(|p| p.as_ref().to_os_string()));
        };

        push(&[&"--unshare-all", &"--die-with-parent", &"--new-session"]);
        if self.share_net {
            push(&[&"--share-net"]);
        }
        for dir in READ_ONLY_SYSTEM_DIRS {
            let path = Path::new(dir);
            match std::fs::symlink_metadata(path) {
                // usr-merged distributions link /bin -> usr/bin and friends
                Ok(meta) if meta.file_type().is_symlink() => {
                    if let Ok(target) = std::fs::read_link(path) {
                        push(&[&"--symlink", &target, dir]);
                    }
                }
                Ok(_) => push(&[&"--ro-bind", dir, dir]),
                Err(_) => {}
            }
        }
        push(&[&"--proc", &"/proc", &"--dev", &"/dev", &"--tmpfs", &"/tmp"]);
        push(&[&"--bind", &guard.host_root(), &guard.guest_root()]);
        push(&[&"--chdir", &cwd.guest]);
        push(&[&"--clearenv"]);
        for (key, value) in passthrough_env(&self.env_allowlist) {
            push(&[&"--setenv", &key, &value]);
        }
        push(&[&"--setenv", &"HOME", &guard.guest_root()]);
        push(&[&"--setenv", &"PWD", &cwd.guest]);
        push(&[&"/bin/sh", &"-c", &script]);
        args
    }
}

impl Launcher for BubblewrapLauncher {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    fn command(
        &self,
        guard: &PathGuard,
        cwd: &SafePath,
        script: &str,
    ) -> Result<Command, SandboxError> {
        let mut command = Command::new(&self.bwrap);
        command.args(self.args(guard, cwd, script)).env_clear();
        Ok(command)
    }
}
