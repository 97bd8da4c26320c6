use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::paths::{self, store_path, temp_path};
use crate::reference_finder::find_reference;
use crate::subprocess::run_git;

/// Above this many entries in `objects/pack/`, a refresh triggers `git gc`
/// to consolidate the small incremental packs that reference reuse leaves
/// behind over time.
const REPACK_PACK_THRESHOLD: usize = 500;

/// Ensure that `root/<remote>/<owner>/<repo>` is a bare mirror whose refs
/// reflect the upstream as of a moment at or after this call.
///
/// Not internally reentrant — callers must guarantee at most one in-flight
/// refresh per target path (the request coordinator does this).
///
/// # Errors
/// Any failing step returns [`Error::Stage`] naming the stage and wrapping
/// the underlying cause. No partial mirror is ever published: `local` is
/// only mutated by the final remove-then-rename pair.
#[instrument(skip_all, fields(remote, owner, repo))]
pub async fn refresh(root: &Path, remote: &str, owner: &str, repo: &str) -> Result<PathBuf> {
    let local = store_path(root, remote, owner, repo);
    let temp = temp_path(root, remote, owner, repo);
    let upstream = paths::upstream_url(remote, owner, repo);

    let exists_local = tokio::fs::try_exists(&local).await.map_err(|e| Error::io(&local, e))?;

    let (reference, exists_ref) = if exists_local {
        (Some(local.clone()), true)
    } else {
        match find_reference(root, repo)
            .await
            .map_err(|e| e.at_stage("find_reference"))?
        {
            Some(found) => (Some(found), true),
            None => (None, false),
        }
    };

    remove_dir_if_present(&temp)
        .await
        .map_err(|e| e.at_stage("clean_temp"))?;

    clone_bare(&temp, &upstream, reference.as_deref())
        .await
        .map_err(|e| e.at_stage("clone"))?;

    if exists_ref {
        let reference = reference.as_deref().expect("exists_ref implies reference");
        hardlink_packs(reference, &temp)
            .await
            .map_err(|e| e.at_stage("hardlink_packs"))?;
    }

    run_git(&temp, &["update-server-info"])
        .await
        .map_err(|e| e.at_stage("update_server_info"))?;

    if exists_ref {
        remove_alternates(&temp)
            .await
            .map_err(|e| e.at_stage("remove_alternates"))?;
    }

    if pack_count(&temp).await.unwrap_or(0) > REPACK_PACK_THRESHOLD {
        info!(path = %temp.display(), "repacking, pack count exceeds threshold");
        run_git(&temp, &["gc"]).await.map_err(|e| e.at_stage("gc"))?;
    }

    if exists_local {
        remove_dir_if_present(&local)
            .await
            .map_err(|e| e.at_stage("remove_published"))?;
    }

    tokio::fs::rename(&temp, &local)
        .await
        .map_err(|e| Error::io(&temp, e))
        .map_err(|e| e.at_stage("publish"))?;

    Ok(local)
}

async fn clone_bare(dest: &Path, upstream_url: &str, reference: Option<&Path>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    let dest_str = dest.to_string_lossy().into_owned();
    let mut args: Vec<&str> = vec!["clone", "--bare"];
    let reference_str;
    if let Some(reference) = reference {
        reference_str = reference.to_string_lossy().into_owned();
        args.push("--reference-if-able");
        args.push(&reference_str);
    }
    args.push(upstream_url);
    args.push(&dest_str);

    run_git(
        dest.parent().unwrap_or_else(|| Path::new(".")),
        &args,
    )
    .await
}

/// Hard-link every pack file from `reference`'s object store into `dest`'s,
/// so the mirror can become self-contained without a full pack copy.
/// Without `--dissociate` the clone leaves an `alternates` file pointing at
/// `reference`; this makes that dependency removable at near-zero I/O cost.
async fn hardlink_packs(reference: &Path, dest: &Path) -> Result<()> {
    let src_pack = reference.join("objects").join("pack");
    let dest_pack = dest.join("objects").join("pack");

    let mut entries = match tokio::fs::read_dir(&src_pack).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(&src_pack, e)),
    };

    tokio::fs::create_dir_all(&dest_pack)
        .await
        .map_err(|e| Error::io(&dest_pack, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io(&src_pack, e))?
    {
        let src_file = entry.path();
        let dest_file = dest_pack.join(entry.file_name());
        if tokio::fs::try_exists(&dest_file).await.unwrap_or(false) {
            continue;
        }
        if let Err(e) = tokio::fs::hard_link(&src_file, &dest_file).await {
            // Cross-device links (and filesystems without hardlink support,
            // notably some Windows configurations) fall back to a copy.
            warn!(
                src = %src_file.display(),
                dest = %dest_file.display(),
                error = %e,
                "hard link failed, falling back to copy"
            );
            tokio::fs::copy(&src_file, &dest_file)
                .await
                .map_err(|e| Error::io(&dest_file, e))?;
        }
    }

    Ok(())
}

async fn remove_alternates(repo: &Path) -> Result<()> {
    let alternates = repo.join("objects").join("info").join("alternates");
    match tokio::fs::remove_file(&alternates).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(&alternates, e)),
    }
}

async fn pack_count(repo: &Path) -> Result<usize> {
    let pack_dir = repo.join("objects").join("pack");
    let mut entries = match tokio::fs::read_dir(&pack_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::io(&pack_dir, e)),
    };
    let mut count = 0usize;
    while entries
        .next_entry()
        .await
        .map_err(|e| Error::io(&pack_dir, e))?
        .is_some()
    {
        count += 1;
    }
    Ok(count)
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}
