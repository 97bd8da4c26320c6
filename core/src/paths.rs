use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Validate a single path segment captured from an HTTP route (`remote`,
/// `owner`, `repo`, or a release cache key). Rejects anything that could
/// escape the store root or smuggle in a nested path.
///
/// # Errors
/// Returns [`Error::BadRequest`] if `segment` is empty, is `.`/`..`, or
/// contains a path separator.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::bad_request("path segment must not be empty"));
    }
    if segment == "." || segment == ".." {
        return Err(Error::bad_request(format!(
            "path segment '{segment}' is not allowed"
        )));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(Error::bad_request(format!(
            "path segment '{segment}' must not contain a separator"
        )));
    }
    Ok(())
}

/// `remote` must contain at least one dot; this is what lets the reference
/// finder and the router tell remote subtrees apart from `releases`.
pub fn is_remote_host(remote: &str) -> bool {
    remote.contains('.')
}

/// `S/<remote>/<owner>/<repo>` — the published bare mirror.
pub fn store_path(root: &Path, remote: &str, owner: &str, repo: &str) -> PathBuf {
    root.join(remote).join(owner).join(repo)
}

/// `S/<remote>/<owner>/<repo>.tmp` — the in-progress mirror being built.
pub fn temp_path(root: &Path, remote: &str, owner: &str, repo: &str) -> PathBuf {
    let mut name = repo.to_string();
    name.push_str(".tmp");
    root.join(remote).join(owner).join(name)
}

/// `S/releases/<key>` — a fully published release cache entry.
pub fn release_path(root: &Path, key: &str) -> PathBuf {
    root.join("releases").join(key)
}

/// `S/releases/<key>.tmp` — a partial release body.
pub fn release_temp(root: &Path, key: &str) -> PathBuf {
    let mut name = key.to_string();
    name.push_str(".tmp");
    root.join("releases").join(name)
}

/// `S/releases/<key>.url` — diagnostic reverse-lookup descriptor.
pub fn release_descriptor(root: &Path, key: &str) -> PathBuf {
    let mut name = key.to_string();
    name.push_str(".url");
    root.join("releases").join(name)
}

/// The upstream clone URL for `(remote, owner, repo)`.
pub fn upstream_url(remote: &str, owner: &str, repo: &str) -> String {
    format!("https://{remote}/{owner}/{repo}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_segment_rejects_empty() {
        assert!(validate_segment("").is_err());
    }

    #[test]
    fn validate_segment_rejects_dotdot() {
        assert!(validate_segment("..").is_err());
    }

    #[test]
    fn validate_segment_rejects_separator() {
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("a\\b").is_err());
    }

    #[test]
    fn validate_segment_accepts_normal_name() {
        assert!(validate_segment("widget").is_ok());
        assert!(validate_segment("widget.git").is_ok());
    }

    #[test]
    fn remote_host_requires_dot() {
        assert!(is_remote_host("example.com"));
        assert!(!is_remote_host("releases"));
    }

    #[test]
    fn store_path_layout() {
        let root = Path::new("/data");
        assert_eq!(
            store_path(root, "example.com", "acme", "widget"),
            PathBuf::from("/data/example.com/acme/widget")
        );
        assert_eq!(
            temp_path(root, "example.com", "acme", "widget"),
            PathBuf::from("/data/example.com/acme/widget.tmp")
        );
    }

    #[test]
    fn release_path_layout() {
        let root = Path::new("/data");
        assert_eq!(
            release_path(root, "abc123"),
            PathBuf::from("/data/releases/abc123")
        );
        assert_eq!(
            release_temp(root, "abc123"),
            PathBuf::from("/data/releases/abc123.tmp")
        );
        assert_eq!(
            release_descriptor(root, "abc123"),
            PathBuf::from("/data/releases/abc123.url")
        );
    }

    #[test]
    fn upstream_url_format() {
        assert_eq!(
            upstream_url("example.com", "acme", "widget"),
            "https://example.com/acme/widget"
        );
    }
}
