use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gitcache_core::Error as CoreError;

/// Wraps [`CoreError`] so it can be returned directly from axum handlers.
/// The HTTP mapping lives here, not in `gitcache-core`, per the core's own
/// design: the caching engine doesn't know about HTTP.
pub struct AppError(pub CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        tracing::error!(error = %self.0, %status, "request failed");
        (status, self.0.to_string()).into_response()
    }
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
        CoreError::Stage { source, .. } => status_for(source),
    }
}
