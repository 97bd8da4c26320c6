use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::is_remote_host;

/// Find any existing mirror under `root` whose final path segment matches
/// `name` or its suffix-toggled variant (`name` without `.git`, or `name`
/// with `.git` appended).
///
/// A shallow three-level walk: `root/*` (restricted to entries containing a
/// dot, i.e. remote subtrees — this is what keeps the walk out of
/// `root/releases`), then owner subdirectories, then the two candidate
/// basenames. Returns the first match; no ordering is guaranteed and none
/// is needed — any repository sharing history accelerates a clone, so a
/// different match than some other caller might expect is never incorrect,
/// only a possibly smaller speedup.
///
/// # Errors
/// Returns `Ok(None)` when no matching basename has ever been seen — this
/// is not an error condition, it means "clone without a reference". Any
/// unexpected I/O error reading the store is propagated.
pub async fn find_reference(root: &Path, name: &str) -> Result<Option<PathBuf>> {
    let candidates = basename_variants(name);

    let mut remotes = match tokio::fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(crate::error::Error::io(root, e)),
    };

    while let Some(remote_entry) = remotes
        .next_entry()
        .await
        .map_err(|e| crate::error::Error::io(root, e))?
    {
        let remote_name = remote_entry.file_name();
        let Some(remote_name) = remote_name.to_str() else {
            continue;
        };
        if !is_remote_host(remote_name) {
            continue;
        }

        let remote_path = remote_entry.path();
        let mut owners = match tokio::fs::read_dir(&remote_path).await {
            Ok(rd) => rd,
            Err(_) => continue,
        };

        while let Some(owner_entry) = owners
            .next_entry()
            .await
            .map_err(|e| crate::error::Error::io(&remote_path, e))?
        {
            let owner_path = owner_entry.path();
            for candidate in &candidates {
                let repo_path = owner_path.join(candidate);
                if tokio::fs::try_exists(&repo_path).await.unwrap_or(false) {
                    return Ok(Some(repo_path));
                }
            }
        }
    }

    Ok(None)
}

/// `foo` and `foo.git` are the same repository for reference-reuse purposes.
fn basename_variants(name: &str) -> Vec<String> {
    match name.strip_suffix(".git") {
        Some(stripped) => vec![name.to_string(), stripped.to_string()],
        None => vec![name.to_string(), format!("{name}.git")],
    }
}
