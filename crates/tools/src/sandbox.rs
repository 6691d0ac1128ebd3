//! Workspace path confinement for file and shell-adjacent tools.
//!
//! Models frequently hand back container-style absolute paths (`/mnt/…`),
//! so those are tolerated and re-rooted onto the host workspace. Everything
//! else must resolve inside the workspace after symlink resolution, except
//! under the named symlinks every workspace carries.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Symlink roots a path may legitimately leave the workspace through.
pub const PERMITTED_ROOTS: &[&str] = &["conversation_data", "agent-memory", "temp"];

/// Resolve a tool-supplied path against the conversation workspace.
///
/// The path does not need to exist; the deepest existing ancestor is
/// canonicalized and the remainder appended lexically, so symlinks already
/// on disk are followed while nonexistent targets still resolve.
pub fn resolve_path(requested: &str, workspace: &Path) -> Result<PathBuf, String> {
    // Tolerate container-absolute forms.
    let stripped = if requested == "/mnt" {
        "."
    } else {
        requested.strip_prefix("/mnt/").unwrap_or(requested)
    };

    let relative = Path::new(stripped);
    let joined = if relative.is_absolute() {
        relative.to_path_buf()
    } else {
        workspace.join(relative)
    };
    let resolved = resolve_lenient(&joined);

    // Paths entering through a permitted symlink may leave the workspace,
    // but only into that symlink's own target.
    if !relative.is_absolute() {
        if let Some(Component::Normal(first)) = relative.components().next() {
            if PERMITTED_ROOTS.iter().any(|root| first == *root) {
                let base = resolve_lenient(&workspace.join(first));
                if resolved.starts_with(&base) {
                    return Ok(resolved);
                }
                return Err(outside_error(requested));
            }
        }
    }

    let workspace_resolved = resolve_lenient(workspace);
    if resolved.starts_with(&workspace_resolved) {
        Ok(resolved)
    } else {
        Err(outside_error(requested))
    }
}

fn outside_error(requested: &str) -> String {
    format!("Error: Path `{requested}` resolves outside the conversation workspace")
}

/// Canonicalize the deepest existing ancestor, then append the rest with
/// lexical `.`/`..` handling.
fn resolve_lenient(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                tail.push(name.to_os_string());
                if !existing.pop() {
                    break;
                }
            }
            None => break,
        }
    }

    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for component in tail.iter().rev() {
        if component == ".." {
            resolved.pop();
        } else if component != "." {
            resolved.push(component);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: PathBuf,
        workspace: PathBuf,
    }

    /// Replicates the conversation workspace layout: shared agent-memory,
    /// per-conversation data, and the two symlinks plus temp/.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().to_path_buf();
        let memory = runtime.join("agent-memory");
        let data = runtime.join("conversation-data").join("conv-1");
        let workspace = runtime.join("agent-working-directory").join("conv-1");
        fs::create_dir_all(&memory).unwrap();
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(workspace.join("temp")).unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&memory, workspace.join("agent-memory")).unwrap();
            std::os::unix::fs::symlink(&data, workspace.join("conversation_data")).unwrap();
        }
        Fixture {
            _dir: dir,
            runtime,
            workspace,
        }
    }

    #[test]
    fn plain_relative_path_stays_inside() {
        let fx = fixture();
        let resolved = resolve_path("notes.txt", &fx.workspace).unwrap();
        assert!(resolved.starts_with(fx.workspace.canonicalize().unwrap()));
        assert!(resolved.ends_with("notes.txt"));
    }

    #[test]
    fn nonexistent_nested_path_resolves() {
        let fx = fixture();
        let resolved = resolve_path("new/dir/file.txt", &fx.workspace).unwrap();
        assert!(resolved.ends_with("new/dir/file.txt"));
    }

    #[test]
    fn mnt_prefix_is_rerooted() {
        let fx = fixture();
        let resolved = resolve_path("/mnt/notes.txt", &fx.workspace).unwrap();
        assert!(resolved.starts_with(fx.workspace.canonicalize().unwrap()));

        let root = resolve_path("/mnt", &fx.workspace).unwrap();
        assert_eq!(root, fx.workspace.canonicalize().unwrap());
    }

    #[test]
    fn dotdot_escape_is_rejected_with_outside() {
        let fx = fixture();
        let err = resolve_path("../..", &fx.workspace).unwrap_err();
        assert!(err.contains("outside"));

        let err = resolve_path("a/../../other", &fx.workspace).unwrap_err();
        assert!(err.contains("outside"));
    }

    #[test]
    fn host_absolute_path_is_rejected() {
        let fx = fixture();
        let err = resolve_path("/etc/passwd", &fx.workspace).unwrap_err();
        assert!(err.contains("outside"));
    }

    #[cfg(unix)]
    #[test]
    fn permitted_symlinks_resolve_to_their_targets() {
        let fx = fixture();
        fs::write(fx.runtime.join("agent-memory/fact.md"), "remembered").unwrap();

        let resolved = resolve_path("agent-memory/fact.md", &fx.workspace).unwrap();
        assert_eq!(
            resolved,
            fx.runtime.canonicalize().unwrap().join("agent-memory/fact.md")
        );

        let resolved = resolve_path("conversation_data/out.json", &fx.workspace).unwrap();
        assert!(resolved.starts_with(fx.runtime.canonicalize().unwrap().join("conversation-data")));
    }

    #[test]
    fn temp_is_a_permitted_root() {
        let fx = fixture();
        let resolved = resolve_path("temp/scratch.bin", &fx.workspace).unwrap();
        assert!(resolved.ends_with("temp/scratch.bin"));
    }

    #[cfg(unix)]
    #[test]
    fn escape_through_permitted_root_is_rejected() {
        let fx = fixture();
        let err = resolve_path("agent-memory/../../../etc", &fx.workspace).unwrap_err();
        assert!(err.contains("outside"));
    }

    #[cfg(unix)]
    #[test]
    fn unlisted_symlink_pointing_outside_is_rejected() {
        let fx = fixture();
        let outside = fx.runtime.join("secrets");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fx.workspace.join("sneaky")).unwrap();

        let err = resolve_path("sneaky/creds.txt", &fx.workspace).unwrap_err();
        assert!(err.contains("outside"));
    }
}
