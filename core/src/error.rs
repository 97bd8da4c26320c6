use std::path::PathBuf;

/// All errors produced by the caching engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An upstream collaborator (the `git` subprocess, or an HTTP origin)
    /// failed. Carries whatever diagnostic text is available verbatim.
    #[error("upstream error ({what}): {detail}")]
    Upstream { what: String, detail: String },

    /// A filesystem operation failed. Always produced via [`Error::io`] so
    /// the path that caused it is preserved in the message.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A release URL is already being downloaded by this process.
    #[error("already downloading: {0}")]
    TooManyRequests(String),

    /// The request could not be served as-is (missing/invalid input).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Wraps an underlying error with the name of the refresh stage that
    /// produced it, per the repository cache's step-by-step contract.
    #[error("refresh stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn upstream(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Upstream {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn too_many_requests(url: impl Into<String>) -> Self {
        Self::TooManyRequests(url.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Annotate an `io::Error` with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.into().display(), err),
        ))
    }

    /// Wrap `self` with the name of the refresh stage that produced it.
    pub fn at_stage(self, stage: &'static str) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// True if this is the "duplicate in-flight" kind.
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Self::TooManyRequests(_))
    }
}
