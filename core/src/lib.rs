//! Caching engine behind a read-through proxy for git mirrors and HTTP
//! release downloads.
//!
//! Two independent caches share one on-disk store rooted at a single
//! directory:
//!
//! - [`repo_cache`] maintains bare git mirrors, cloning against a sibling
//!   repository's objects when one is known (see [`reference_finder`]) so
//!   that related repositories on the same host share pack data.
//! - [`release_cache`] maintains HTTP-downloaded release assets, keyed by
//!   a validator (`ETag`/`Last-Modified`) rather than the request URL, so
//!   that two URLs serving the same bytes collapse to one cache entry.
//!
//! [`coordinator::RefreshCoordinator`] sits in front of `repo_cache` to
//! coalesce concurrent refreshes of the same mirror into a single `git`
//! invocation with a bounded retry; `release_cache` does its own
//! single-flight gating per URL, rejecting a concurrent duplicate rather
//! than joining it, since a partial download can be resumed cheaply on
//! the next request.

pub mod coordinator;
pub mod error;
pub mod paths;
pub mod reference_finder;
pub mod release_cache;
pub mod repo_cache;
pub mod subprocess;

pub use coordinator::RefreshCoordinator;
pub use error::{Error, Result};
pub use release_cache::{ReleaseCache, ReleaseOutcome};
