use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::repo_cache;

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<PathBuf, Arc<Error>>>>;

/// Coalesces concurrent refresh requests for the same mirror into a single
/// underlying `repo_cache::refresh` call, with a bounded retry on failure.
///
/// A second caller arriving while a refresh for the same `(remote, owner,
/// repo)` is already running is handed a clone of the same in-flight
/// future rather than starting its own `git clone`.
#[derive(Default)]
pub struct RefreshCoordinator {
    inflight: DashMap<PathBuf, RefreshFuture>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Ensure the mirror at `root/<remote>/<owner>/<repo>` is refreshed,
    /// joining an in-flight refresh for the same target if one exists.
    ///
    /// # Errors
    /// The last attempt's error, after [`MAX_ATTEMPTS`] failed tries.
    pub async fn refresh(
        &self,
        root: &Path,
        remote: &str,
        owner: &str,
        repo: &str,
    ) -> Result<PathBuf> {
        let key = crate::paths::store_path(root, remote, owner, repo);

        let fut = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| {
                let root = root.to_path_buf();
                let remote = remote.to_string();
                let owner = owner.to_string();
                let repo = repo.to_string();
                // Spawned so the refresh keeps running (and later joiners
                // keep seeing progress) even if the first caller's task is
                // cancelled before the future resolves.
                tokio::spawn(retrying_refresh(root, remote, owner, repo))
                    .map(|joined| match joined {
                        Ok(result) => result,
                        Err(e) => Err(Arc::new(Error::upstream("refresh", e.to_string()))),
                    })
                    .boxed()
                    .shared()
            })
            .clone();

        let result = fut.await;
        self.inflight.remove(&key);
        result.map_err(|arc_err| {
            Arc::try_unwrap(arc_err).unwrap_or_else(|e| Error::upstream("refresh", e.to_string()))
        })
    }
}

/// Retry `repo_cache::refresh` up to [`MAX_ATTEMPTS`] times with a fixed
/// delay between tries, logging each failed attempt. Wrapped in `Arc`
/// because `Shared` requires a `Clone` error type.
async fn retrying_refresh(
    root: PathBuf,
    remote: String,
    owner: String,
    repo: String,
) -> std::result::Result<PathBuf, Arc<Error>> {
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match repo_cache::refresh(&root, &remote, &owner, &repo).await {
            Ok(path) => {
                if attempt > 1 {
                    info!(%remote, %owner, %repo, attempt, "refresh succeeded after retry");
                }
                return Ok(path);
            }
            Err(e) => {
                warn!(%remote, %owner, %repo, attempt, error = %e, "refresh attempt failed");
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(Arc::new(last_err.expect("loop runs at least once")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn concurrent_refreshes_of_same_target_share_one_future() {
        let store = TempDir::new().unwrap();
        let coordinator = Arc::new(RefreshCoordinator::new());

        // Neither "remote" resolves nor does git exist as a guarantee in
        // every test environment; what this exercises is that both calls
        // return the *same* error (i.e. joined the same future) rather
        // than each independently spawning a clone attempt.
        let root = store.path().to_path_buf();
        let c1 = Arc::clone(&coordinator);
        let r1 = root.clone();
        let c2 = Arc::clone(&coordinator);
        let r2 = root.clone();

        let (a, b) = tokio::join!(
            tokio::spawn(
                async move { c1.refresh(&r1, "nonexistent.invalid", "acme", "widget").await }
            ),
            tokio::spawn(
                async move { c2.refresh(&r2, "nonexistent.invalid", "acme", "widget").await }
            ),
        );

        assert!(a.unwrap().is_err());
        assert!(b.unwrap().is_err());
        assert!(coordinator.inflight.is_empty());
    }
}
