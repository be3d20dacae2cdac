//! §4.2 — path-prefix allow-list with syntactic traversal normalization.

use std::path::{Path, PathBuf};

use crate::error::{Result, SupervisorError};

/// Normalize a path by resolving `.` and `..` components syntactically,
/// without touching the filesystem (unlike `std::fs::canonicalize`, which
/// requires the path to exist and would let us be fooled by symlinks we
/// can't yet see, or simply fail for a not-yet-created session cwd).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            ParentDir => {
                if matches!(components.last(), Some(Normal(_))) {
                    components.pop();
                }
            }
            CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Allow-list of absolute roots a session's cwd must fall under. An empty
/// allow-list means allow-all.
pub struct CwdSandbox {
    roots: Vec<PathBuf>,
}

impl CwdSandbox {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots: roots.into_iter().map(|r| normalize_path(&r)).collect() }
    }

    /// True iff the canonical form of `path` equals a root, or lies under a
    /// root such that the next character after the root is the path
    /// separator (so `/R-evil` is rejected for root `/R`).
    pub fn check(&self, path: &Path) -> bool {
        if self.roots.is_empty() {
            return true;
        }
        let normalized = normalize_path(path);
        // `Path::strip_prefix` is component-aware, so it already refuses the
        // "/R-evil" vs "/R" false-prefix match without an explicit separator check.
        self.roots.iter().any(|root| normalized == *root || normalized.strip_prefix(root).is_ok())
    }

    pub fn assert_allowed(&self, path: &Path) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        if self.check(path) {
            Ok(normalized)
        } else {
            Err(SupervisorError::CwdDenied { path: normalized.display().to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dotdot_syntactically() {
        assert_eq!(
            normalize_path(Path::new("/R/x/../../etc")),
            PathBuf::from("/etc")
        );
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let sandbox = CwdSandbox::new(vec![]);
        assert!(sandbox.check(Path::new("/anything")));
    }

    #[test]
    fn rejects_false_prefix_sibling() {
        let sandbox = CwdSandbox::new(vec![PathBuf::from("/R")]);
        assert!(!sandbox.check(Path::new("/R-evil")));
        assert!(sandbox.check(Path::new("/R")));
        assert!(sandbox.check(Path::new("/R/x")));
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        let sandbox = CwdSandbox::new(vec![PathBuf::from("/R")]);
        assert!(!sandbox.check(Path::new("/R/x/../../etc")));
        assert!(sandbox.assert_allowed(Path::new("/R/x/../../etc")).is_err());
    }

    proptest::proptest! {
        #[test]
        fn soundness_matches_prefix_definition(segments in proptest::collection::vec("[a-z]{1,6}", 0..6)) {
            let root = PathBuf::from("/root");
            let sandbox = CwdSandbox::new(vec![root.clone()]);
            let mut candidate = root.clone();
            for s in &segments {
                candidate.push(s);
            }
            let normalized = normalize_path(&candidate);
            let expected = normalized == root || normalized.strip_prefix(&root).is_ok();
            assert_eq!(sandbox.check(&candidate), expected);
        }
    }
}
