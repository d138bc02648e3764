//! Path containment.
//!
//! Any path argument to a filesystem-capable tool is resolved against the
//! session working directory and must stay inside it (or inside an explicit
//! allowlist entry). Paths that do not exist yet are validated through their
//! nearest existing ancestor so writes to new files still get checked.

use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

/// Resolve `path` against `working_dir` and verify containment.
pub fn contain_path(path: &str, working_dir: &Path, allowed: &[PathBuf]) -> Result<PathBuf> {
    if path.contains('\0') {
        return Err(EngineError::PathTraversal {
            path: path.to_string(),
        });
    }

    let resolved = {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            working_dir.join(p)
        }
    };

    // Traversal components are rejected outright; canonicalization alone
    // cannot vouch for paths that do not exist yet.
    if resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(EngineError::PathTraversal {
            path: path.to_string(),
        });
    }

    let canonical = canonicalize_lenient(&resolved)?;
    let root = working_dir
        .canonicalize()
        .unwrap_or_else(|_| working_dir.to_path_buf());

    if canonical.starts_with(&root) {
        return Ok(canonical);
    }

    for entry in allowed {
        let entry = entry.canonicalize().unwrap_or_else(|_| entry.clone());
        if canonical.starts_with(&entry) {
            return Ok(canonical);
        }
    }

    Err(EngineError::PathTraversal {
        path: path.to_string(),
    })
}

/// Canonicalize through the nearest existing ancestor, then re-append the
/// missing suffix.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return path.canonicalize().map_err(|_| EngineError::PathTraversal {
            path: path.display().to_string(),
        });
    }

    let mut base = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();

    while !base.exists() {
        match base.file_name() {
            Some(name) => suffix.push(name.to_owned()),
            None => break,
        }
        if !base.pop() {
            break;
        }
    }

    let mut canonical = if base.as_os_str().is_empty() {
        PathBuf::from(".")
            .canonicalize()
            .map_err(EngineError::Io)?
    } else {
        base.canonicalize().map_err(EngineError::Io)?
    };

    for component in suffix.into_iter().rev() {
        canonical.push(component);
    }
    Ok(canonical)
}

/// Argument names the gate treats as paths.
pub fn is_path_argument(name: &str) -> bool {
    matches!(
        name,
        "path" | "file" | "file_path" | "dir" | "directory" | "target" | "source" | "dest"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_inside_workdir_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let result = contain_path("src/main.rs", dir.path(), &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            contain_path("../../etc/passwd", dir.path(), &[]),
            Err(EngineError::PathTraversal { .. })
        ));
        assert!(matches!(
            contain_path("sub/../../escape", dir.path(), &[]),
            Err(EngineError::PathTraversal { .. })
        ));
    }

    #[test]
    fn absolute_path_outside_workdir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            contain_path("/etc/passwd", dir.path(), &[]),
            Err(EngineError::PathTraversal { .. })
        ));
    }

    #[test]
    fn allowlisted_root_is_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let inside = other.path().join("notes.txt");
        let result = contain_path(
            inside.to_str().unwrap(),
            dir.path(),
            &[other.path().to_path_buf()],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn new_file_under_workdir_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let result = contain_path("new_dir/new_file.txt", dir.path(), &[]);
        assert!(result.is_ok());
    }

    #[test]
    fn symlink_escape_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), &link).unwrap();
            assert!(matches!(
                contain_path("link/secret.txt", dir.path(), &[]),
                Err(EngineError::PathTraversal { .. })
            ));
        }
    }
}
