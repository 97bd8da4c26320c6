use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::paths::{release_descriptor, release_path, release_temp};

/// Outcome of [`ReleaseCache::fetch`]: either the body is already on disk
/// and the caller should hand `path` to a static-file responder, or the
/// body must be streamed live while the cache fill completes.
pub enum ReleaseOutcome {
    /// Serve this file directly (memory or disk fast path, or a resumed
    /// temp file whose size already matches the advertised length).
    CachedFile(PathBuf),
    /// Serve this stream to the client; it tees into the cache file as it
    /// is consumed. `content_length` is the upstream-advertised length.
    Streaming {
        body: ReleaseBody,
        content_length: Option<u64>,
    },
}

/// Process-lifetime soft indexes backing the release cache. Entries are
/// advisory: a `urlToPath` hit is re-validated by `stat` before use, and
/// nothing here is persisted across restarts.
pub struct ReleaseCache {
    url_to_path: Arc<DashMap<String, PathBuf>>,
    inflight: Arc<DashSet<String>>,
}

impl Default for ReleaseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseCache {
    pub fn new() -> Self {
        Self {
            url_to_path: Arc::new(DashMap::new()),
            inflight: Arc::new(DashSet::new()),
        }
    }

    /// Serve `url`'s body, populating the cache as needed.
    ///
    /// # Errors
    /// [`Error::TooManyRequests`] if another download of `url` is already
    /// in flight in this process. [`Error::Upstream`] if the HEAD/GET
    /// probe fails or returns an unexpected status. [`Error::Io`] for
    /// local filesystem failures.
    #[instrument(skip(self, client), fields(url))]
    pub async fn fetch(
        &self,
        client: &reqwest::Client,
        root: &Path,
        url: &str,
    ) -> Result<ReleaseOutcome> {
        // Step 1: memory fast path.
        if let Some(entry) = self.url_to_path.get(url) {
            let path = entry.value().clone();
            drop(entry);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(ReleaseOutcome::CachedFile(path));
            }
            self.url_to_path.remove(url);
        }

        // Step 2: validator probe.
        let probe = head_probe(client, url).await?;
        let key = validator_key(&probe);

        // Step 3: disk fast path.
        let published = release_path(root, &key);
        if tokio::fs::try_exists(&published).await.unwrap_or(false) {
            self.url_to_path.insert(url.to_string(), published.clone());
            return Ok(ReleaseOutcome::CachedFile(published));
        }

        // Step 4: single-flight gate. Must be acquired before the step 5(a)
        // promote check below: that check and the rename it performs are
        // only safe for the one caller holding this slot — otherwise two
        // concurrent callers can both observe a full-length temp file (one
        // racing another download's background publish) and both attempt
        // the rename, with the loser surfacing a spurious `ENOENT` instead
        // of the clean 429 the single-flight invariant promises.
        if !self.inflight.insert(url.to_string()) {
            return Err(Error::too_many_requests(url));
        }

        // Step 5(a): a resumable temp file whose size already matches the
        // advertised length can be promoted without another network call.
        let temp = release_temp(root, &key);
        if probe.accept_ranges {
            if let Ok(metadata) = tokio::fs::metadata(&temp).await {
                if Some(metadata.len()) == probe.content_length {
                    let promoted = async {
                        self.publish_descriptor(root, url, &key).await?;
                        tokio::fs::rename(&temp, &published)
                            .await
                            .map_err(|e| Error::io(&temp, e))
                    }
                    .await;
                    self.inflight.remove(url);
                    return match promoted {
                        Ok(()) => {
                            self.url_to_path.insert(url.to_string(), published.clone());
                            Ok(ReleaseOutcome::CachedFile(published))
                        }
                        Err(e) => Err(e),
                    };
                }
            }
        }

        match self.fill(client, root, url, &key, &probe).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.inflight.remove(url);
                Err(e)
            }
        }
    }

    async fn publish_descriptor(&self, root: &Path, url: &str, key: &str) -> Result<()> {
        let descriptor = release_descriptor(root, key);
        tokio::fs::write(&descriptor, format!("{url}\n{key}"))
            .await
            .map_err(|e| Error::io(&descriptor, e))
    }

    /// Steps 5(b)-7: resume-or-fresh GET, tee-stream, publish. The
    /// in-flight marker for `url` is cleared once the background copy task
    /// finishes (successfully or not).
    async fn fill(
        &self,
        client: &reqwest::Client,
        root: &Path,
        url: &str,
        key: &str,
        probe: &ValidatorProbe,
    ) -> Result<ReleaseOutcome> {
        let temp = release_temp(root, key);
        let (resp, mut temp_file, prefix) = start_or_resume(client, url, &temp, probe).await?;

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
        if let Some(prefix_bytes) = prefix {
            debug!(len = prefix_bytes.len(), "replaying resumed prefix");
            let _ = tx.send(Ok(prefix_bytes)).await;
        }

        let url_owned = url.to_string();
        let key_owned = key.to_string();
        let root_owned = root.to_path_buf();
        let url_to_path = Arc::clone(&self.url_to_path);
        let inflight = Arc::clone(&self.inflight);

        tokio::spawn(async move {
            let copy_result = drain_to_tee(resp, &mut temp_file, &tx).await;
            let publish_result = match copy_result {
                Ok(()) => publish(&root_owned, &url_owned, &key_owned).await,
                Err(e) => Err(e),
            };
            match publish_result {
                Ok(()) => {
                    url_to_path.insert(url_owned.clone(), release_path(&root_owned, &key_owned));
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                }
            }
            inflight.remove(&url_owned);
        });

        Ok(ReleaseOutcome::Streaming {
            body: ReleaseBody { rx },
            content_length: probe.content_length,
        })
    }
}

struct ValidatorProbe {
    validator: String,
    content_length: Option<u64>,
    accept_ranges: bool,
}

async fn head_probe(client: &reqwest::Client, url: &str) -> Result<ValidatorProbe> {
    let resp = client
        .head(url)
        .send()
        .await
        .map_err(|e| Error::upstream(url, e.to_string()))?;

    let etag = resp
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = resp
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let validator = etag.or(last_modified).unwrap_or_default();

    let content_length = resp.content_length();
    let accept_ranges = resp
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "bytes")
        .unwrap_or(false);

    Ok(ValidatorProbe {
        validator,
        content_length,
        accept_ranges,
    })
}

fn validator_key(probe: &ValidatorProbe) -> String {
    let material = format!("{}-{}", probe.validator, probe.content_length.unwrap_or(0));
    let digest = Sha256::digest(material.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Decide between resuming a partial temp file or starting fresh, returning
/// the live response, the open temp file handle (positioned for append
/// when resuming), and — when resuming — the prefix bytes already on disk
/// that must be replayed to the client ahead of the rest of the stream.
async fn start_or_resume(
    client: &reqwest::Client,
    url: &str,
    temp: &Path,
    probe: &ValidatorProbe,
) -> Result<(reqwest::Response, tokio::fs::File, Option<Bytes>)> {
    if probe.accept_ranges {
        if let Ok(metadata) = tokio::fs::metadata(temp).await {
            let existing_len = metadata.len();
            let resp = client
                .get(url)
                .header(reqwest::header::RANGE, format!("bytes={existing_len}-"))
                .send()
                .await
                .map_err(|e| Error::upstream(url, e.to_string()))?;

            if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
                return Err(Error::upstream(
                    url,
                    format!("expected 206 Partial Content, got {}", resp.status()),
                ));
            }

            let prefix = tokio::fs::read(temp).await.map_err(|e| Error::io(temp, e))?;
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(temp)
                .await
                .map_err(|e| Error::io(temp, e))?;
            return Ok((resp, file, Some(Bytes::from(prefix))));
        }
    }

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::upstream(url, e.to_string()))?;
    if resp.status() != reqwest::StatusCode::OK {
        return Err(Error::upstream(
            url,
            format!("expected 200 OK, got {}", resp.status()),
        ));
    }
    if let Some(parent) = temp.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    let file = tokio::fs::File::create(temp).await.map_err(|e| Error::io(temp, e))?;
    Ok((resp, file, None))
}

/// Copy the response body into the temp file and the outgoing channel at
/// once — the tee in "tee-stream". A closed channel (client disconnect)
/// aborts the copy; the partial temp file is left in place so a later
/// request can resume it.
async fn drain_to_tee(
    mut resp: reqwest::Response,
    temp_file: &mut tokio::fs::File,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) -> Result<()> {
    loop {
        let chunk = resp
            .chunk()
            .await
            .map_err(|e| Error::upstream("release body", e.to_string()))?;
        let Some(chunk) = chunk else { break };

        temp_file
            .write_all(&chunk)
            .await
            .map_err(|e| Error::io(Path::new("<release temp>"), e))?;
        if tx.send(Ok(chunk)).await.is_err() {
            return Err(Error::upstream("release body", "client disconnected"));
        }
    }
    temp_file
        .flush()
        .await
        .map_err(|e| Error::io(Path::new("<release temp>"), e))?;
    Ok(())
}

async fn publish(root: &Path, url: &str, key: &str) -> Result<()> {
    let temp = release_temp(root, key);
    let published = release_path(root, key);
    let descriptor = release_descriptor(root, key);

    tokio::fs::write(&descriptor, format!("{url}\n{key}"))
        .await
        .map_err(|e| Error::io(&descriptor, e))?;
    tokio::fs::rename(&temp, &published)
        .await
        .map_err(|e| Error::io(&temp, e))?;
    Ok(())
}

/// A stream of body chunks that also feeds the on-disk cache temp file as
/// they are produced.
pub struct ReleaseBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl futures::Stream for ReleaseBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(validator: &str, len: Option<u64>, ranges: bool) -> ValidatorProbe {
        ValidatorProbe {
            validator: validator.to_string(),
            content_length: len,
            accept_ranges: ranges,
        }
    }

    #[test]
    fn validator_key_ignores_accept_ranges() {
        let a = probe("\"v1\"", Some(1024), true);
        let b = probe("\"v1\"", Some(1024), false);
        assert_eq!(validator_key(&a), validator_key(&b));
    }

    #[test]
    fn validator_key_changes_with_validator() {
        let a = probe("\"v1\"", Some(1024), true);
        let b = probe("\"v2\"", Some(1024), true);
        assert_ne!(validator_key(&a), validator_key(&b));
    }

    #[test]
    fn validator_key_changes_with_length() {
        let a = probe("\"v1\"", Some(1024), true);
        let b = probe("\"v1\"", Some(2048), true);
        assert_ne!(validator_key(&a), validator_key(&b));
    }

    #[test]
    fn validator_key_is_hex_sha256_length() {
        let a = probe("\"v1\"", Some(1024), true);
        assert_eq!(validator_key(&a).len(), 64);
    }

    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A minimal, single-request-per-connection HTTP/1.1 server used in
    /// place of a real upstream. Responds to `HEAD` with headers only and
    /// to `GET` with the full or range-sliced body depending on a `Range`
    /// request header.
    async fn spawn_fake_server(body: Bytes, etag: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move { serve_one(stream, body, etag).await });
            }
        });
        addr
    }

    async fn serve_one(mut stream: tokio::net::TcpStream, body: Bytes, etag: &str) {
        let mut buf = vec![0u8; 8192];
        let n = match stream.read(&mut buf).await {
            Ok(n) if n > 0 => n,
            _ => return,
        };
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        let is_head = request.starts_with("HEAD");
        let range_start = request
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("range:"))
            .and_then(|l| l.split('=').nth(1))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());

        let (status, slice) = match range_start {
            Some(start) if start <= body.len() => ("206 Partial Content", body.slice(start..)),
            _ => ("200 OK", body.clone()),
        };

        let headers = format!(
            "HTTP/1.1 {status}\r\nETag: \"{etag}\"\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            slice.len()
        );
        let _ = stream.write_all(headers.as_bytes()).await;
        if !is_head {
            let _ = stream.write_all(&slice).await;
        }
        let _ = stream.shutdown().await;
    }

    async fn drain(body: &mut ReleaseBody) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn cold_fetch_streams_then_publishes_to_disk() {
        let payload = Bytes::from_static(b"hello release body");
        let addr = spawn_fake_server(payload.clone(), "v1").await;
        let url = format!("http://{addr}/pkg.tgz");

        let store = TempDir::new().unwrap();
        let cache = ReleaseCache::new();
        let client = reqwest::Client::new();

        let outcome = cache.fetch(&client, store.path(), &url).await.unwrap();
        let ReleaseOutcome::Streaming { mut body, content_length } = outcome else {
            panic!("expected a streaming outcome on first fetch");
        };
        assert_eq!(content_length, Some(payload.len() as u64));
        let received = drain(&mut body).await;
        assert_eq!(received, payload.as_ref());

        for _ in 0..50 {
            if cache
                .url_to_path
                .get(&url)
                .map(|p| p.value().exists())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let published = cache.url_to_path.get(&url).unwrap().value().clone();
        assert_eq!(tokio::fs::read(&published).await.unwrap(), payload.as_ref());

        let key = published.file_name().unwrap().to_str().unwrap().to_string();
        let descriptor = release_descriptor(store.path(), &key);
        let descriptor_text = tokio::fs::read_to_string(&descriptor).await.unwrap();
        assert_eq!(descriptor_text, format!("{url}\n{key}"));
    }

    #[tokio::test]
    async fn second_concurrent_fetch_of_same_url_is_rejected() {
        let payload = Bytes::from_static(b"some bytes");
        let addr = spawn_fake_server(payload.clone(), "v1").await;
        let url = format!("http://{addr}/pkg.tgz");

        let store = TempDir::new().unwrap();
        let cache = Arc::new(ReleaseCache::new());
        let client = reqwest::Client::new();

        let first = {
            let cache = Arc::clone(&cache);
            let client = client.clone();
            let root = store.path().to_path_buf();
            let url = url.clone();
            tokio::spawn(async move {
                let outcome = cache.fetch(&client, &root, &url).await.unwrap();
                if let ReleaseOutcome::Streaming { mut body, .. } = outcome {
                    drain(&mut body).await;
                }
            })
        };

        // Give the first call time to clear the HEAD probe and set the
        // in-flight marker before the second arrives.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = cache.fetch(&client, store.path(), &url).await;
        assert!(matches!(second, Err(Error::TooManyRequests(_))));

        first.await.unwrap();
    }

    #[tokio::test]
    async fn resumes_partial_temp_file_via_range_request() {
        let payload = Bytes::from(b"0123456789abcdefghij".to_vec());
        let addr = spawn_fake_server(payload.clone(), "v1").await;
        let url = format!("http://{addr}/pkg.tgz");

        let store = TempDir::new().unwrap();
        let client = reqwest::Client::new();
        let probe = head_probe(&client, &url).await.unwrap();
        let key = validator_key(&probe);

        let temp = release_temp(store.path(), &key);
        tokio::fs::create_dir_all(temp.parent().unwrap()).await.unwrap();
        tokio::fs::write(&temp, &payload[..10]).await.unwrap();

        let cache = ReleaseCache::new();
        let outcome = cache.fetch(&client, store.path(), &url).await.unwrap();
        let ReleaseOutcome::Streaming { mut body, .. } = outcome else {
            panic!("expected a streaming outcome for a resumed, still-short temp file");
        };
        let received = drain(&mut body).await;
        assert_eq!(received, payload.as_ref());

        for _ in 0..50 {
            if tokio::fs::try_exists(release_path(store.path(), &key))
                .await
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let published = tokio::fs::read(release_path(store.path(), &key))
            .await
            .unwrap();
        assert_eq!(published, payload.as_ref());
    }
}
