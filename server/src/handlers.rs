use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use gitcache_core::paths::validate_segment;
use gitcache_core::release_cache::ReleaseOutcome;

use crate::cgi;
use crate::error::AppError;
use crate::AppState;

/// `GET /releases/<url…>` — the captured tail is the full upstream URL,
/// exactly as it appeared after the leading slash.
pub async fn releases(
    State(state): State<Arc<AppState>>,
    Path(url): Path<String>,
) -> Result<Response, AppError> {
    if url.is_empty() {
        return Err(AppError(gitcache_core::Error::bad_request(
            "release URL must not be empty",
        )));
    }

    let outcome = state
        .release_cache
        .fetch(&state.http_client, &state.store_root, &url)
        .await?;

    Ok(match outcome {
        ReleaseOutcome::CachedFile(path) => {
            let service = ServeFile::new(path);
            match service.oneshot(axum::http::Request::new(Body::empty())).await {
                Ok(response) => response.into_response(),
                Err(infallible) => match infallible {},
            }
        }
        ReleaseOutcome::Streaming {
            body,
            content_length,
        } => {
            let mut response = Response::builder().status(StatusCode::OK);
            if let Some(len) = content_length {
                response = response.header(axum::http::header::CONTENT_LENGTH, len.to_string());
            }
            response
                .body(Body::from_stream(body))
                .expect("static response builder call never fails")
        }
    })
}

/// `/<remote>/<owner>/<repo>/<action…>` — refreshes the mirror first when
/// `action == "info/refs"`, then always forwards to the git smart-HTTP
/// backend via the CGI adapter.
pub async fn repo_dispatch(
    State(state): State<Arc<AppState>>,
    Path((remote, owner, repo, action)): Path<(String, String, String, String)>,
    RawQuery(query): RawQuery,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    validate_segment(&remote)?;
    validate_segment(&owner)?;
    validate_segment(&repo)?;
    if !gitcache_core::paths::is_remote_host(&remote) {
        return Err(AppError(gitcache_core::Error::bad_request(
            "remote must contain a dot",
        )));
    }

    let mirror = if method == axum::http::Method::GET && action == "info/refs" {
        state
            .coordinator
            .refresh(&state.store_root, &remote, &owner, &repo)
            .await?
    } else {
        gitcache_core::paths::store_path(&state.store_root, &remote, &owner, &repo)
    };

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let path_info = format!("/{action}");
    let query_string = query.unwrap_or_default();

    let response = cgi::dispatch(
        &mirror,
        method.as_str(),
        &path_info,
        &query_string,
        content_type,
        body,
    )
    .await?;

    Ok(response)
}
