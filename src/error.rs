use std::io;
use thiserror::Error;

/// Errors returned by every layer of the crate.
///
/// None of these are retried internally. `NoRemoteClient` and
/// `RemoteUnavailable` are kept apart so callers can tell "sync is not
/// configured" from "the network is down".
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("integrity check failed for block {address}: content hashes to {actual}")]
    Integrity { address: String, actual: String },

    #[error("transfer rejected: {0}")]
    AdmissionRejected(String),

    #[error("no remote client")]
    NoRemoteClient,

    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
