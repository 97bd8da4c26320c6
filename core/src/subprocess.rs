use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `git <args>` with `cwd` as the working directory, capturing stdout
/// and stderr for diagnostics.
///
/// `git` reports actionable errors on stderr; preserving that text verbatim
/// in the returned error is the only debugging channel available once the
/// request has left this process, so on a non-zero exit both streams are
/// joined into the error detail.
///
/// # Errors
/// Returns [`Error::Upstream`] if the process fails to spawn or exits
/// non-zero.
pub async fn run_git(cwd: &Path, args: &[&str]) -> Result<()> {
    let argv = format!("git {}", args.join(" "));
    debug!(cwd = %cwd.display(), %argv, "exec");

    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::upstream(argv.clone(), format!("failed to spawn: {e}")))?;

    if !output.status.success() {
        let mut detail = String::from_utf8_lossy(&output.stdout).into_owned();
        detail.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(Error::upstream(argv, detail));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_git_version_succeeds() {
        if which_git().is_none() {
            return;
        }
        let cwd = std::env::temp_dir();
        run_git(&cwd, &["--version"]).await.unwrap();
    }

    #[tokio::test]
    async fn run_git_bad_subcommand_fails_with_detail() {
        if which_git().is_none() {
            return;
        }
        let cwd = std::env::temp_dir();
        let err = run_git(&cwd, &["not-a-real-subcommand"]).await.unwrap_err();
        match err {
            Error::Upstream { detail, .. } => assert!(!detail.is_empty()),
            other => panic!("expected Upstream error, got {other:?}"),
        }
    }

    fn which_git() -> Option<()> {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|_| ())
    }
}
