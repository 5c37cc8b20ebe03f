//! Error types for Moto.

use std::io;

use thiserror::Error;

/// Result type alias for Moto operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Moto.
#[derive(Error, Debug)]
pub enum Error {
    // Wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Tunnel transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Dial errors
    #[error("dial failed to {addr}: {reason}")]
    DialFailed { addr: String, reason: String },

    #[error("{0} timed out")]
    Timeout(&'static str),

    // Tunnel errors
    #[error("no tunnel links available")]
    NoTunnels,

    #[error("stream closed")]
    StreamClosed,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Frame parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame magic")]
    InvalidMagic,

    #[error("invalid frame flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("oversized frame: {size} bytes (max {max})")]
    OversizedFrame { size: usize, max: usize },
}

/// Tunnel transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("link write failed: {0}")]
    WriteFailed(String),

    #[error("link read failed: {0}")]
    ReadFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("QUIC error: {0}")]
    Quic(String),
}

impl Error {
    /// Errors that terminate the link they occurred on. Parse failures are
    /// treated the same as I/O failures: the link is torn down and re-dialed,
    /// streams survive on the remaining links.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Transport(_) | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_fatal_classification() {
        assert!(Error::from(ProtocolError::InvalidMagic).is_link_fatal());
        assert!(Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "x")).is_link_fatal());
        assert!(!Error::NoTunnels.is_link_fatal());
        assert!(!Error::Timeout("boost race").is_link_fatal());
    }
}
