use http::StatusCode;

/// Failure taxonomy of the fetch path.
///
/// Only `NoAppFound` and, when no external exporters are configured, the
/// per-instance variants cross the aggregator boundary as real errors.
/// Everything else is downgraded to a synthetic scrape-error sample.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// No candidate route resolves for the given identifier.
    #[error("cannot find app with id or path {0}")]
    NoAppFound(String),

    /// Upstream instance reachable but returned 4xx, no scrape endpoint is
    /// known there.
    #[error("cannot find endpoint '{endpoint}' for app '{app}', create one or pass a metric_path parameter")]
    NoEndpointFound { app: String, endpoint: String },

    /// Network error, unexpected upstream status or decompression failure.
    #[error("{0}")]
    Transport(String),
}

impl FetchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoAppFound(_) => StatusCode::NOT_FOUND,
            Self::NoEndpointFound { .. } => StatusCode::NOT_ACCEPTABLE,
            Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
