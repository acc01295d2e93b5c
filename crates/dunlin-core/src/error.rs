//! Error types for dunlin

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DcError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("protocol framing: {0}")]
    ProtocolFraming(String),

    #[error("protocol syntax: {0}")]
    ProtocolSyntax(String),

    #[error("protocol semantic: {0}")]
    ProtocolSemantic(String),

    #[error("authentication rejected by hub")]
    AuthRejected,

    #[error("no upload slots available")]
    NoSlots,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not supported for this request")]
    UnsupportedRange,

    #[error("requested range exceeds file size")]
    RangeTooBig,

    #[error("content verification failed: {0}")]
    Integrity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnClosed,

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DcError {
    /// Timeouts and closed sockets carry their own variants so callers can
    /// match on them; everything else stays an IO error.
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => DcError::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => DcError::ConnClosed,
            _ => DcError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, DcError>;
