//! Error types for the treefetch library.

use std::path::PathBuf;

use thiserror::Error;

use crate::ftp::FtpError;

/// Errors that can occur while crawling, sizing or transferring files.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code returned by the server.
        status: u16,
    },

    /// Error from the FTP control or data connection.
    #[error("FTP error: {0}")]
    Ftp(#[from] FtpError),

    /// Generic I/O error outside of the destination file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The destination file or its directory could not be created or written.
    #[error("Disk error at {}: {source}", path.display())]
    Disk {
        /// Local path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// URL uses a scheme other than http, https or ftp.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// URL was rejected by the validator.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A directory crawl ended with an error at its root.
    #[error("Crawl failed: {0}")]
    Crawl(String),

    /// A network operation exceeded the request timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Wraps an I/O error that happened on the local destination `path`.
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    /// Returns true for transient failures worth another attempt.
    ///
    /// Validation errors, local disk errors and cancellation are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_)
            | Self::HttpStatus { .. }
            | Self::Ftp(_)
            | Self::Io(_)
            | Self::Timeout(_) => true,
            Self::Disk { .. }
            | Self::UnsupportedScheme(_)
            | Self::InvalidUrl(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Crawl(_)
            | Self::Cancelled => false,
        }
    }
}

/// A specialized `Result` type for treefetch operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retryable() {
        assert!(Error::Timeout("read".into()).is_retryable());
        assert!(
            Error::HttpStatus {
                url: "http://h/f".into(),
                status: 503
            }
            .is_retryable()
        );
        assert!(Error::Ftp(FtpError::connection_failed("refused")).is_retryable());
    }

    #[test]
    fn validation_and_disk_errors_are_final() {
        assert!(!Error::UnsupportedScheme("gopher".into()).is_retryable());
        assert!(!Error::InvalidUrl("::".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        let disk = Error::disk(
            "/nope/file.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!disk.is_retryable());
        assert!(disk.to_string().contains("/nope/file.bin"));
    }
}
