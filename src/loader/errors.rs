//! Error types for the resource loader.

use std::time::Duration;

/// A single fetch attempt against one endpoint failed.
///
/// Every variant is retry-eligible; the loader never surfaces these to callers.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("endpoint answered {status} for {uri}")]
    Status { status: u16, uri: String },
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    RequestFailed(#[from] anyhow::Error),
}

/// Caller mistakes. These are the only errors that cross the loader boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoaderError {
    #[error("resource key must not be blank")]
    InvalidKey,
    #[error("no candidate endpoints supplied for {0}")]
    NoCandidates(String),
}
