//! Error types shared across the client.

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing or invalid argument: {0}")]
    BadArgs(String),

    #[error("Authentication failed: {0}")]
    BadAuth(String),

    #[error("Malformed server response: {0}")]
    BadResp(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Server busy, retries exhausted")]
    Eagain,

    #[error("Content MAC mismatch")]
    MacMismatch,

    #[error("Worker limit exceeded (max {0})")]
    WorkerLimitExceeded(usize),

    #[error("Attribute blob malformed")]
    BadAttr,

    #[error("Server error code {0}")]
    ServerCode(i64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MEGA "try again" application error code.
pub(crate) const EAGAIN_CODE: i64 = -3;
/// MEGA "bad session id" application error code.
pub(crate) const ESID_CODE: i64 = -15;

/// Map a numeric server error code to a typed error.
///
/// Code 0 means success and must be filtered out by the caller before
/// reaching here.
pub(crate) fn error_from_code(code: i64) -> Error {
    match code {
        EAGAIN_CODE => Error::Eagain,
        ESID_CODE => Error::BadAuth(format!("server rejected session (code {})", code)),
        c => Error::ServerCode(c),
    }
}

impl Error {
    /// Whether the request layer should retry after this error.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::Eagain | Error::Network(_))
    }
}
