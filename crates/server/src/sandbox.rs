//! Path validation for the sibling file APIs.
//!
//! Two modes: project-relative paths are confined to the project's real
//! directory; absolute paths are normalized and accepted as-is. Both
//! reject anything that could escape or confuse the filesystem layer.

use std::path::{Component, Path, PathBuf};

use crate::error::{GatewayError, GatewayResult};

/// Characters that never belong in a project-relative request path
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

/// Validate a project-relative path and resolve it against the project
/// root. The result is guaranteed to stay inside the root.
pub fn resolve_project_relative(root: &Path, raw: &str) -> GatewayResult<PathBuf> {
    if raw.is_empty() {
        return Err(GatewayError::invalid("empty path"));
    }
    if raw.contains(UNSAFE_CHARS) {
        return Err(GatewayError::invalid(format!(
            "path contains forbidden characters: {raw:?}"
        )));
    }
    if has_drive_prefix(raw) {
        return Err(GatewayError::invalid(format!(
            "drive-prefixed path not allowed: {raw}"
        )));
    }

    let candidate = Path::new(raw);
    if candidate.is_absolute() || raw.starts_with('/') || raw.starts_with('\\') {
        return Err(GatewayError::invalid(format!(
            "absolute path not allowed here: {raw}"
        )));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(GatewayError::invalid(format!(
            "parent traversal not allowed: {raw}"
        )));
    }

    let resolved = normalize(&root.join(candidate));
    if !resolved.starts_with(root) {
        return Err(GatewayError::invalid(format!(
            "path escapes the project root: {raw}"
        )));
    }
    Ok(resolved)
}

/// Validate an absolute path: platform-dependent absoluteness test, then
/// lexical normalization.
pub fn resolve_absolute(raw: &str) -> GatewayResult<PathBuf> {
    if raw.contains('\0') {
        return Err(GatewayError::invalid("path contains NUL"));
    }
    let candidate = Path::new(raw);
    if !candidate.is_absolute() {
        return Err(GatewayError::invalid(format!(
            "expected an absolute path: {raw}"
        )));
    }
    Ok(normalize(candidate))
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Lexical normalization: resolves `.` and collapses nothing else. `..`
/// components never reach this point in project-relative mode.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/projects/app")
    }

    #[test]
    fn traversal_and_absolute_shapes_are_rejected() {
        for bad in ["../etc/passwd", "/etc/passwd", "C:\\Windows", "foo\0bar"] {
            assert!(
                matches!(
                    resolve_project_relative(&root(), bad),
                    Err(GatewayError::InvalidArgument(_))
                ),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn shell_unsafe_characters_are_rejected() {
        for bad in ["a<b", "a>b", "a|b", "what?.txt", "star*.rs", "quo\"te"] {
            assert!(resolve_project_relative(&root(), bad).is_err());
        }
    }

    #[test]
    fn plain_relative_paths_resolve_inside_the_root() {
        let resolved = resolve_project_relative(&root(), "etc/passwd").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/projects/app/etc/passwd"));
        assert!(resolved.starts_with(root()));
    }

    #[test]
    fn current_dir_components_normalize_away() {
        let resolved = resolve_project_relative(&root(), "./src/./main.rs").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/projects/app/src/main.rs"));
    }

    #[test]
    fn absolute_mode_requires_absoluteness() {
        assert!(resolve_absolute("relative/path").is_err());
        assert!(resolve_absolute("C:\\Windows").is_err());
        assert_eq!(
            resolve_absolute("/var/log/./syslog").unwrap(),
            PathBuf::from("/var/log/syslog")
        );
    }
}
