//! Error types for the extended apiserver

use std::io;

use thiserror::Error;

/// Result type alias for the extended apiserver
pub type Result<T> = std::result::Result<T, Error>;

/// Extended apiserver errors
#[derive(Error, Debug)]
pub enum Error {
    /// Certificate storage could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Key generation, certificate signing or parsing failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A certificate authority or persisted label does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller input was rejected before any key material was produced
    #[error("Validation error: {0}")]
    Validation(String),

    /// Outbound call failed (timeout, refused connection, handshake failure)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a storage error that names the path involved.
    pub fn storage(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{}: {err}", path.display()))
    }

    /// Whether this error means the requested item is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Keep the full source chain; reqwest's top-level message hides the cause.
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        if err.is_timeout() {
            message = format!("request timed out: {message}");
        }
        Self::Transport(message)
    }
}
