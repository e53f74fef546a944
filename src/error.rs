//! Error taxonomy shared by every component of the companion core.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Connect, read or write failure on the stream or a REST call. Always recoverable.
    #[error("transport error: {0}")]
    Transport(String),

    /// A server payload that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A preview target refused by the fetch policy (blocked address, size, scheme, redirects).
    #[error("{0}")]
    Policy(String),

    /// Token missing locally or rejected by the server.
    #[error("credential error: {0}")]
    Credential(String),

    /// Non-2xx REST response.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Invalid settings or command input.
    #[error("{0}")]
    Config(String),

    /// Settings or cache file IO and (de)serialization.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// True for failures the stream loop absorbs into a Backoff transition.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Storage(_))
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        Error::Storage(format!("{what} lock poisoned"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Error::Protocol(error.to_string())
        } else {
            Error::Transport(error.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
