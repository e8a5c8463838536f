//! Error types shared across the server.
//!
//! Startup failures (`StorageError`, `ConfigError`) abort the process before
//! any connection is accepted. `SessionError` never leaves the session that
//! raised it: the driver logs it and closes that one connection.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The content source could not be turned into a payload.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read content from '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer closed the channel (EOF or a negative transfer count).
    #[error("channel closed by peer")]
    ChannelClosed,

    /// Any other I/O fault: reset, broken pipe, idle timeout.
    #[error("transport fault: {0}")]
    Transport(#[from] io::Error),

    /// A completion arrived for an operation the session never issued.
    #[error("completion for {got} while {expected} was pending")]
    OutOfOrder {
        expected: &'static str,
        got: &'static str,
    },
}

impl SessionError {
    /// Whether this is an ordinary disconnect rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::ChannelClosed => true,
            SessionError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            SessionError::OutOfOrder { .. } => false,
        }
    }
}
