//! Containment checks for caller-supplied paths.
//!
//! Every path handed to the filesystem manager goes through [`resolve`]
//! before any filesystem call is made. [`resolve_verified`] additionally
//! follows symlinks of paths that already exist and re-checks the result.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{FileError, Result};

/// Join `relative` onto `root`, refusing anything that could leave it.
///
/// A leading `/` is stripped so absolute-looking input lands inside the
/// root. `..`, NUL bytes and platform prefixes are rejected outright, even
/// when they would resolve back inside the root. Pure: touches no files.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.contains('\0') {
        warn!("Path contains a null byte");
        return Err(FileError::PathTraversal);
    }

    let relative = relative.trim_start_matches('/');
    let mut resolved = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => resolved.push(name),
            Component::CurDir => {}
            Component::ParentDir => {
                warn!("Rejected parent directory reference in {:?}", relative);
                return Err(FileError::PathTraversal);
            }
            Component::RootDir | Component::Prefix(_) => {
                warn!("Rejected absolute component in {:?}", relative);
                return Err(FileError::PathTraversal);
            }
        }
    }

    if !resolved.starts_with(root) {
        return Err(FileError::PathTraversal);
    }

    Ok(resolved)
}

/// [`resolve`] plus a symlink check against the canonical root.
///
/// Existing paths are canonicalised; for paths that do not exist yet the
/// nearest existing ancestor is checked and canonicalised instead.
pub fn resolve_verified(root: &Path, relative: &str) -> Result<PathBuf> {
    let built = resolve(root, relative)?;

    let Some(existing) = built.ancestors().find(|p| p.exists()) else {
        return Ok(built);
    };
    if !existing.starts_with(root) {
        // The root itself does not exist yet; nothing below it can escape.
        return Ok(built);
    }

    let canonical_root = root.canonicalize()?;
    let canonical = existing.canonicalize()?;
    if !canonical.starts_with(&canonical_root) {
        warn!(
            "Symlink escape: {:?} resolved to {:?} outside {:?}",
            built, canonical, canonical_root
        );
        return Err(FileError::PathTraversal);
    }

    // Rebase the not-yet-existing tail onto the canonical ancestor so every
    // returned path shares the canonical root as prefix.
    match built.strip_prefix(existing) {
        Ok(rest) if !rest.as_os_str().is_empty() => Ok(canonical.join(rest)),
        _ => Ok(canonical),
    }
}

/// Path of `full` relative to `root` with `/` separators.
pub fn relative_to(root: &Path, full: &Path) -> String {
    let Ok(relative) = full.strip_prefix(root) else {
        return String::new();
    };

    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Make a user-supplied label safe for use as a single file name.
///
/// Returns None when nothing usable is left.
pub fn sanitize_label(label: &str) -> Option<String> {
    let cleaned: String = label
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            _ => c,
        })
        .collect();

    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        return None;
    }

    Some(cleaned.chars().take(128).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ========================================================================
    // resolve
    // ========================================================================

    #[test]
    fn test_resolve_plain_paths() {
        let root = Path::new("/srv/keel/w1");
        assert_eq!(resolve(root, "").unwrap(), root);
        assert_eq!(resolve(root, ".").unwrap(), root);
        assert_eq!(
            resolve(root, "plugins/a.jar").unwrap(),
            root.join("plugins/a.jar")
        );
        assert_eq!(
            resolve(root, "./logs/./latest.log").unwrap(),
            root.join("logs/latest.log")
        );
    }

    #[test]
    fn test_resolve_absolute_input_stays_inside() {
        let root = Path::new("/srv/keel/w1");
        assert_eq!(resolve(root, "/etc/passwd").unwrap(), root.join("etc/passwd"));
        assert_eq!(resolve(root, "///x").unwrap(), root.join("x"));
    }

    #[test]
    fn test_resolve_rejects_parent_dir() {
        let root = Path::new("/srv/keel/w1");
        for bad in ["..", "../w2", "a/../../w2", "a/b/../../..", "/../etc"] {
            assert!(
                matches!(resolve(root, bad), Err(FileError::PathTraversal)),
                "accepted {bad}"
            );
        }
        // Rejected even when it would resolve back inside.
        assert!(resolve(root, "a/../b").is_err());
    }

    #[test]
    fn test_resolve_rejects_null_byte() {
        let root = Path::new("/srv/keel/w1");
        assert!(matches!(
            resolve(root, "a\0b"),
            Err(FileError::PathTraversal)
        ));
    }

    #[test]
    fn test_resolve_result_always_under_root() {
        let root = Path::new("/srv/keel/w1");
        let inputs = [
            "a", "/a", "a/b/c", "./a", "a//b", "...", "..a", "a..", ".hidden", "a/./.",
            "../", "a/..", "\0", "/", "",
        ];
        for input in inputs {
            if let Ok(path) = resolve(root, input) {
                assert!(path.starts_with(root), "{input} escaped to {path:?}");
            }
        }
    }

    // ========================================================================
    // resolve_verified
    // ========================================================================

    #[test]
    fn test_resolve_verified_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();

        let root = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(matches!(
            resolve_verified(root.path(), "link/secret"),
            Err(FileError::PathTraversal)
        ));
        assert!(matches!(
            resolve_verified(root.path(), "link/new-file"),
            Err(FileError::PathTraversal)
        ));
    }

    #[test]
    fn test_resolve_verified_allows_internal_symlink() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("real")).unwrap();
        fs::write(root.path().join("real/f.txt"), "x").unwrap();
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let resolved = resolve_verified(root.path(), "alias/f.txt").unwrap();
        assert!(resolved.ends_with("real/f.txt"));
    }

    #[test]
    fn test_resolve_verified_new_nested_path() {
        let root = TempDir::new().unwrap();
        let resolved = resolve_verified(root.path(), "a/b/c.txt").unwrap();
        assert_eq!(resolved, root.path().canonicalize().unwrap().join("a/b/c.txt"));
    }

    // ========================================================================
    // helpers
    // ========================================================================

    #[test]
    fn test_relative_to() {
        let root = Path::new("/srv/w");
        assert_eq!(relative_to(root, Path::new("/srv/w/a/b.txt")), "a/b.txt");
        assert_eq!(relative_to(root, Path::new("/srv/w")), "");
        assert_eq!(relative_to(root, Path::new("/elsewhere")), "");
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("nightly"), Some("nightly".to_string()));
        assert_eq!(sanitize_label("pre update/1"), Some("pre_update_1".to_string()));
        assert_eq!(sanitize_label("../.."), None);
        assert_eq!(sanitize_label(""), None);
        assert_eq!(sanitize_label(&"a".repeat(300)).unwrap().len(), 128);
    }
}
