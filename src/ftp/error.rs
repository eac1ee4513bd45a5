//! Categorised FTP errors.

use thiserror::Error;

/// What went wrong on an FTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// TCP connect or DNS resolution failed.
    ConnectionFailed,
    /// The server answered a command with a 4xx/5xx reply.
    CommandRejected,
    /// PASV/EPSV negotiation or the data connection failed.
    DataChannel,
    /// The server sent something that is not an FTP reply.
    Protocol,
    /// An operation exceeded the request timeout.
    Timeout,
    /// The server closed the control connection.
    Disconnected,
}

/// An FTP failure with an optional reply code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FtpError {
    /// Failure category.
    pub kind: FtpErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Reply code that triggered the error, if any.
    pub code: Option<u16>,
}

/// Result alias for FTP operations.
pub type FtpResult<T> = Result<T, FtpError>;

impl FtpError {
    /// Creates an error of the given kind.
    pub fn new(kind: FtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// Connection could not be established.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, message)
    }

    /// Data channel could not be opened or read.
    pub fn data_channel(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannel, message)
    }

    /// Unparseable server response.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, message)
    }

    /// Operation timed out.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, message)
    }

    /// Server hung up.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, message)
    }

    /// Builds an error from a negative reply.
    pub fn rejected(code: u16, text: &str) -> Self {
        Self {
            kind: FtpErrorKind::CommandRejected,
            message: format!("{code} {text}"),
            code: Some(code),
        }
    }
}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Self::disconnected(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::timeout(e.to_string()),
            _ => Self::connection_failed(e.to_string()),
        }
    }
}
