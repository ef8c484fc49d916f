//! Workspace path confinement.
//!
//! User-supplied paths are workspace-relative strings. [`resolve`] maps
//! them to absolute paths that are always descendants of the workspace
//! root: a path that would escape after normalisation has its `..`
//! segments stripped and is rejoined under the root. The caller never
//! learns that an escape was attempted; this is a confinement policy, not
//! an error signal. Symlinks inside the workspace are trusted and not
//! resolved here.

use std::path::{Component, Path, PathBuf};

/// Resolve a user-supplied path against the workspace root.
///
/// The result is always a descendant of (or equal to) the normalised
/// root. This is a total function: there is no error case.
pub fn resolve(root: &Path, user_path: &str) -> PathBuf {
    let root = normalize(root);
    let joined = normalize(&root.join(user_path));

    if joined.starts_with(&root) {
        return joined;
    }

    // Escape attempt: drop every non-normal segment and rejoin.
    let stripped: PathBuf = Path::new(user_path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();

    normalize(&root.join(stripped))
}

/// Lexical normalisation: resolves `.` and `..` without touching the
/// filesystem. `..` at the root is absorbed.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            // pop() is a no-op at the filesystem root, which absorbs
            // leading `..` segments on absolute paths.
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(segment) => out.push(segment),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_paths_land_under_root() {
        let resolved = resolve(Path::new("/work"), "src/main.rs");
        assert_eq!(resolved, PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn dot_segments_are_collapsed() {
        let resolved = resolve(Path::new("/work"), "./src/./lib/../main.rs");
        assert_eq!(resolved, PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn parent_escape_is_rewritten_into_root() {
        let resolved = resolve(Path::new("/work"), "../etc/passwd");
        assert_eq!(resolved, PathBuf::from("/work/etc/passwd"));
    }

    #[test]
    fn deep_escape_is_rewritten_into_root() {
        let resolved = resolve(Path::new("/work"), "../../../../etc/shadow");
        assert_eq!(resolved, PathBuf::from("/work/etc/shadow"));
    }

    #[test]
    fn absolute_user_path_is_rewritten_into_root() {
        let resolved = resolve(Path::new("/work"), "/etc/passwd");
        assert_eq!(resolved, PathBuf::from("/work/etc/passwd"));
    }

    #[test]
    fn interior_parent_segments_that_stay_inside_are_kept() {
        let resolved = resolve(Path::new("/work"), "a/b/../c");
        assert_eq!(resolved, PathBuf::from("/work/a/c"));
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let resolved = resolve(Path::new("/work"), "");
        assert_eq!(resolved, PathBuf::from("/work"));
    }

    #[test]
    fn every_output_is_a_descendant_of_root() {
        let root = Path::new("/work");
        let hostile = [
            "..",
            "../..",
            "../../etc/passwd",
            "/etc/passwd",
            "a/../../..",
            "a/../../b/../../c",
            "./../x",
        ];
        for candidate in hostile {
            let resolved = resolve(root, candidate);
            assert!(
                resolved.starts_with(root),
                "'{}' resolved to '{}' outside the root",
                candidate,
                resolved.display()
            );
        }
    }
}
