//! Command policy for restricted workspaces.
//!
//! Paths are confined by [`PathGuard`](crate::PathGuard); this layer decides
//! which binaries a script may invoke at all. A workspace configured with
//! `allowed_binaries` gets a [`BinaryAllowlist`]; every other workspace gets
//! [`AllowAllPolicy`].
//!
//! Scripts are parsed with tree-sitter-bash so that commands hidden inside
//! pipelines, lists, subshells, function bodies and command substitutions are
//! all checked, not just the first word.
//!
//! ```rust,ignore
//! use hermit::policy::{BinaryAllowlist, CommandPolicy};
//!
//! let policy = BinaryAllowlist::new(["ls", "cat", "git", "cargo*"]);
//! assert!(policy.check_script("ls | cat").is_allowed());
//! assert!(!policy.check_script("ls; rm -rf /").is_allowed());
//! ```

mod handler;
mod parse;

pub use handler::{
    AllowAllPolicy, BinaryAllowlist, CommandInfo, CommandPolicy, PolicyDecision,
    policy_for_workspace,
};
pub use parse::{ParseError, extract_commands};
