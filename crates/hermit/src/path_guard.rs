//! Path confinement for workspace filesystems.
//!
//! [`resolve`] is the whole security boundary: a pure, lexical resolution of a
//! caller-supplied path against a workspace root. It never touches the
//! filesystem, so links planted inside a hostile sandbox cannot steer it.
//!
//! [`PathGuard`] pairs that resolution with the mapping from the guest view of
//! a workspace (`/workspace/...`, what agents and callers see) to the host
//! directory that backs it.

use std::path::{Component, Path, PathBuf};

use crate::error::{SandboxError, log_safe};

/// Resolve `raw` against `root`, rejecting anything that would escape it.
///
/// - Empty or whitespace-only input resolves to `root` itself.
/// - Relative input is joined to `root`; absolute input is taken as-is.
/// - `.` segments are dropped and `..` segments pop one component. Popping
///   past the filesystem root is a rejection, never a clamp.
/// - The final path must be `root` or a descendant of it.
///
/// `root` is expected to be absolute and already normalized.
pub fn resolve(raw: &str, root: &Path) -> Result<PathBuf, SandboxError> {
    if raw.trim().is_empty() {
        return Ok(root.to_path_buf());
    }
    if raw.contains('\0') {
        return Err(reject(raw));
    }

    let input = Path::new(raw);
    let mut resolved = if input.is_absolute() {
        PathBuf::from("/")
    } else {
        root.to_path_buf()
    };

    for component in input.components() {
        match component {
            Component::RootDir => resolved = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(reject(raw));
                }
            }
            Component::Normal(part) => resolved.push(part),
            Component::Prefix(_) => return Err(reject(raw)),
        }
    }

    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(reject(raw))
    }
}

fn reject(raw: &str) -> SandboxError {
    tracing::debug!(path = %log_safe(raw), "rejected path outside workspace root");
    SandboxError::PathTraversal
}

/// A path that passed [`resolve`], in both its guest and host forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath {
    /// Path as seen inside the sandbox (e.g. `/workspace/src/main.rs`).
    pub guest: PathBuf,
    /// Path relative to the workspace root (empty for the root itself).
    pub relative: PathBuf,
    /// Backing path on the host.
    pub host: PathBuf,
}

impl SafePath {
    /// Whether this is the workspace root itself.
    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }
}

/// Confines paths to one workspace and maps them onto its host directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    guest_root: PathBuf,
    host_root: PathBuf,
}

impl PathGuard {
    /// Create a guard for a workspace whose guest root is backed by `host_root`.
    pub fn new(guest_root: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        Self {
            guest_root: guest_root.into(),
            host_root: host_root.into(),
        }
    }

    /// The guest-visible root (e.g. `/workspace`).
    pub fn guest_root(&self) -> &Path {
        &self.guest_root
    }

    /// The host directory backing the workspace.
    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Resolve a caller-supplied path in the guest namespace.
    pub fn resolve(&self, raw: &str) -> Result<SafePath, SandboxError> {
        let guest = resolve(raw, &self.guest_root)?;
        let relative = guest
            .strip_prefix(&self.guest_root)
            .map_err(|_| SandboxError::PathTraversal)?
            .to_path_buf();
        let host = if relative.as_os_str().is_empty() {
            self.host_root.clone()
        } else {
            self.host_root.join(&relative)
        };
        Ok(SafePath {
            guest,
            relative,
            host,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn root() -> &'static Path {
        Path::new("/workspace")
    }

    #[test]
    fn test_empty_defaults_to_root() {
        assert_eq!(resolve("", root()).unwrap(), PathBuf::from("/workspace"));
        assert_eq!(resolve("   ", root()).unwrap(), PathBuf::from("/workspace"));
    }

    #[test]
    fn test_relative_paths_join_root() {
        assert_eq!(
            resolve("src/main.rs", root()).unwrap(),
            PathBuf::from("/workspace/src/main.rs")
        );
        assert_eq!(
            resolve("./src/../Cargo.toml", root()).unwrap(),
            PathBuf::from("/workspace/Cargo.toml")
        );
    }

    #[test]
    fn test_absolute_inside_root() {
        assert_eq!(
            resolve("/workspace/a/b", root()).unwrap(),
            PathBuf::from("/workspace/a/b")
        );
        assert_eq!(resolve("/workspace", root()).unwrap(), root());
    }

    #[test]
    fn test_traversal_rejected() {
        for raw in [
            "/workspace/../../etc/passwd",
            "../etc/passwd",
            "..",
            "/etc/passwd",
            "/",
            "a/../../..",
            "/workspace/./../workspace2/file",
            "../../../../../../../../../../etc/shadow",
        ] {
            assert!(
                matches!(resolve(raw, root()), Err(SandboxError::PathTraversal)),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn test_sibling_with_common_prefix_rejected() {
        // "/workspace-other" shares a string prefix but not a path prefix
        assert!(resolve("/workspace-other/x", root()).is_err());
        assert!(resolve("../workspace-other", root()).is_err());
    }

    #[test]
    fn test_nul_byte_rejected() {
        assert!(resolve("file\0name", root()).is_err());
    }

    #[test]
    fn test_reentry_after_leaving_is_judged_on_final_path() {
        assert_eq!(
            resolve("a/../../workspace/b", root()).unwrap(),
            PathBuf::from("/workspace/b")
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let inputs = ["x/y/../z", "/workspace/./q", "", "../nope"];
        for raw in inputs {
            let first = resolve(raw, root()).ok();
            let second = resolve(raw, root()).ok();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_every_accepted_path_has_root_prefix() {
        let inputs = [
            "a", "a/b/c", "./a/./b", "a/../b", "/workspace/x/../y", "x/../../workspace/z",
        ];
        for raw in inputs {
            let resolved = resolve(raw, root()).unwrap();
            assert!(resolved.starts_with(root()), "{raw:?} -> {resolved:?}");
        }
    }

    #[test]
    fn test_guard_maps_guest_to_host() {
        let guard = PathGuard::new("/workspace", "/srv/hermit/ws-1");

        let safe = guard.resolve("/workspace/src/lib.rs").unwrap();
        assert_eq!(safe.guest, PathBuf::from("/workspace/src/lib.rs"));
        assert_eq!(safe.relative, PathBuf::from("src/lib.rs"));
        assert_eq!(safe.host, PathBuf::from("/srv/hermit/ws-1/src/lib.rs"));
        assert!(!safe.is_root());

        let root = guard.resolve("").unwrap();
        assert!(root.is_root());
        assert_eq!(root.host, PathBuf::from("/srv/hermit/ws-1"));
    }

    #[test]
    fn test_guard_never_maps_outside_host_root() {
        let guard = PathGuard::new("/workspace", "/srv/hermit/ws-1");
        assert!(guard.resolve("/workspace/../../etc/passwd").is_err());
        assert!(guard.resolve("/srv/hermit/ws-1/file").is_err());
    }
}
