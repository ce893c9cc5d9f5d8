//! Typed errors that drive HTTP status-code dispatch (spec section 7).

use thiserror::Error;

/// Result of classifying a request URI against the cache / coordination state.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("path escapes the cache root")]
    InvalidPath,
}

/// Errors surfaced while a [`crate::downloader::Downloader`] tries mirrors.
#[derive(Debug, Error, Clone)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("not found on any mirror")]
    NotFound,

    #[error("all mirrors exhausted")]
    Exhausted,
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

/// Errors from verifying the signed POST body (component H).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization or Timestamp header")]
    MissingHeader,

    #[error("timestamp is not a valid integer")]
    BadTimestamp,

    #[error("timestamp is stale")]
    StaleTimestamp,

    #[error("hmac does not match")]
    BadHmac,
}

/// Errors while parsing / dispatching an incoming client request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request")]
    Malformed,

    #[error("request body exceeds limit")]
    BodyTooLarge,

    #[error("unsupported range request")]
    UnsupportedRange,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// True for I/O errors shaped like the client hanging up rather than a
    /// genuine server-side failure — `handle_connection` uses this to decide
    /// whether a shared downloader should keep running for other waiters.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            RequestError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
