use std::path::PathBuf;
use thiserror::Error;

/// The requested name does not follow the artifact grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid artifact filename: {0:?}")]
pub struct InvalidFilename(pub String);

pub type FetchResult<T> = Result<T, FetchError>;

/// Why an artifact could not be made available locally.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream has no such artifact: {url}")]
    UpstreamNotFound { url: String },

    #[error("upstream returned {status} for {url}")]
    UpstreamStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("upstream request failed for {url}: {source}")]
    UpstreamTransport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cache I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification of a [`FetchError`], one per client-visible outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Upstream authoritatively lacks the artifact (404)
    NotFound,
    /// Upstream unreachable, erroring, or too slow (502)
    Unavailable,
    /// Scratch write or publish failed on this host (500)
    LocalIo,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::UpstreamNotFound { .. } => FetchErrorKind::NotFound,
            FetchError::UpstreamStatus { .. } | FetchError::UpstreamTransport { .. } => {
                FetchErrorKind::Unavailable
            }
            FetchError::LocalIo { .. } => FetchErrorKind::LocalIo,
        }
    }

    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FetchError::LocalIo {
            path: path.into(),
            source,
        }
    }
}

impl FetchErrorKind {
    /// Stable lowercase label, used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::Unavailable => "unavailable",
            FetchErrorKind::LocalIo => "local_io",
        }
    }
}
