use std::path::Path;
use std::process::Stdio;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};

use gitcache_core::Error as CoreError;

/// Forward one HTTP request to `git http-backend`, the CGI entrypoint the
/// smart-HTTP git transport uses to serve a bare mirror.
///
/// `path_info` is the part of the URL after `/<remote>/<owner>/<repo>`,
/// including its leading slash (e.g. `/info/refs`).
#[instrument(skip(body), fields(mirror = %mirror.display(), %path_info))]
pub async fn dispatch(
    mirror: &Path,
    method: &str,
    path_info: &str,
    query_string: &str,
    content_type: Option<&str>,
    body: Bytes,
) -> Result<Response, CoreError> {
    let mut command = Command::new("git");
    command
        .arg("http-backend")
        .env("GIT_PROJECT_ROOT", mirror)
        .env("GIT_HTTP_EXPORT_ALL", "")
        .env("REQUEST_METHOD", method)
        .env("PATH_INFO", path_info)
        .env("QUERY_STRING", query_string)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(content_type) = content_type {
        command.env("CONTENT_TYPE", content_type);
    }

    let mut child = command
        .spawn()
        .map_err(|e| CoreError::upstream("git http-backend", format!("failed to spawn: {e}")))?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    // Written from a separate task so a large request body can't deadlock
    // against a backend that starts writing its own (large) response
    // before the body is fully drained.
    tokio::spawn(async move {
        let _ = stdin.write_all(&body).await;
    });

    let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
    let (headers, status) = read_cgi_headers(&mut stdout).await?;

    let mut stderr = child.stderr.take().expect("piped stderr");
    tokio::spawn(async move {
        match child.wait().await {
            Ok(exit) if !exit.success() => {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                warn!(status = %exit, detail = %text, "git http-backend exited non-zero");
            }
            Err(e) => warn!(error = %e, "failed to wait on git http-backend"),
            Ok(_) => {}
        }
    });

    let body = Body::from_stream(ReaderStream::new(stdout));
    let mut response = Response::builder().status(status);
    if let Some(response_headers) = response.headers_mut() {
        *response_headers = headers;
    }
    response
        .body(body)
        .map_err(|e| CoreError::upstream("git http-backend", e.to_string()))
}

/// `git http-backend`'s CGI protocol writes a block of `Name: value`
/// header lines terminated by a blank line, then the body. A `Status:`
/// header (if present) sets the HTTP status; its absence means `200 OK`.
async fn read_cgi_headers<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(HeaderMap, StatusCode), CoreError> {
    let mut headers = HeaderMap::new();
    let mut status = StatusCode::OK;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| CoreError::upstream("git http-backend", e.to_string()))?;
        if read == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("Status") {
            if let Some(code) = value.split_whitespace().next() {
                if let Ok(parsed) = code.parse::<u16>() {
                    status = StatusCode::from_u16(parsed).unwrap_or(StatusCode::OK);
                }
            }
            continue;
        }

        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    Ok((headers, status))
}
