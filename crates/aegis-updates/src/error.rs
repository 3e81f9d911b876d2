//! Error types surfaced by the update registry.
//!
//! Every error that crosses a module boundary carries the identifier, path,
//! or URL it is about; callers retry transport failures, everything else is
//! reported as-is.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used throughout the registry.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors produced by registry operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource {0} is not available locally and the registry is offline")]
    NotAvailableLocally(String),

    #[error("no verification rule covers {0}")]
    VerificationNotConfigured(String),

    #[error("index {0}: fetched bytes do not match the signed hash")]
    IndexChecksumMismatch(String),

    #[error("index {path}: published timestamp {published} is in the future")]
    IndexFromFuture { path: String, published: String },

    #[error("index {path}: published timestamp {published} precedes the known last release {last_release}")]
    IndexIsOlder {
        path: String,
        published: String,
        last_release: String,
    },

    #[error("index {path}: declared channel {got:?} does not match expected channel {expected:?}")]
    IndexChannelMismatch {
        path: String,
        expected: String,
        got: String,
    },

    #[error("invalid version {0:?}")]
    InvalidVersion(String),

    #[error("version {version} of {identifier} is not known")]
    VersionNotFound {
        identifier: String,
        version: String,
    },

    #[error("cannot blacklist the last usable version of {0}")]
    BlacklistLastVersion(String),

    #[error("download policy must be at least as strict as the disk-load policy")]
    PolicyOrdering,

    #[error("signature error for {path}: {reason}")]
    Signature { path: String, reason: String },

    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("no mirrors configured")]
    NoMirrors,

    #[error("failed to build the http client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("parse error for {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{context} at {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("no selected version for {0}")]
    NoSelectedVersion(String),

    #[error("unpacking is not supported for {0}")]
    UnsupportedArchive(String),

    #[error("unpacked entry {path} exceeds the size limit")]
    UnpackedTooLarge { path: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Wrap an I/O error with the operation and the responsible path.
    pub fn io(context: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        UpdateError::Io {
            context,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap a parse failure with the file or identifier it came from.
    pub fn parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        UpdateError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a signature failure with the file it came from.
    pub fn signature(path: impl Into<String>, reason: impl Into<String>) -> Self {
        UpdateError::Signature {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
