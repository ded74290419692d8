//! Error types for the tunnel engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by transports, the route engine, the pool and the RPC
/// protocol.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame arrived that is not valid at this point of the session.
    #[error("invalid message")]
    InvalidMessage,

    /// Writing a payload to the target connection was incomplete.
    #[error("short write")]
    ShortWrite,

    /// Writing a payload to the local destination was incomplete.
    #[error("packet loss: wrote {written} of {expected} bytes")]
    PacketLoss { written: usize, expected: usize },

    /// The header named a user that is not on the allowlist.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No route, including no default, matched the destination.
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// The destination resolved to the block egress.
    #[error("unimplemented")]
    Unimplemented,

    /// The operation is not available on this transport.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Connecting to the target failed.
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to the target did not finish in time.
    #[error("dial {0}: timed out")]
    DialTimeout(String),

    /// The pool has no connections to hand out.
    #[error("connection pool not initialized")]
    PoolNotInitialized,

    /// The server ended the session with an error status.
    #[error("remote session error")]
    RemoteError,

    /// The RPC call failed.
    #[error("rpc: {0}")]
    Rpc(#[from] tonic::Status),

    /// Establishing the RPC channel failed.
    #[error("rpc transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// An external route source file could not be read.
    #[error("read route source {path}: {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A regex route source did not compile.
    #[error("compile regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A CIDR route source did not parse.
    #[error("parse cidr {0:?}")]
    Cidr(String),

    /// The session was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true for errors that mark a normal end of a session: EOF,
    /// reset by the peer after close, or cancellation.
    pub fn is_clean_close(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Io(e) => is_clean_io(e),
            Error::Rpc(status) => status.code() == tonic::Code::Cancelled,
            _ => false,
        }
    }

    /// Returns true if the error came from the RPC channel itself rather
    /// than from the session's payload or peer.
    pub fn is_channel_failure(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Rpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Unknown
            ),
            _ => false,
        }
    }
}

pub(crate) fn is_clean_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidMessage => tonic::Status::invalid_argument(message),
            Error::UserNotFound(_) => tonic::Status::permission_denied(message),
            Error::RouteNotFound(_) | Error::Unimplemented => {
                tonic::Status::failed_precondition(message)
            }
            Error::Dial { .. } | Error::DialTimeout(_) => tonic::Status::unavailable(message),
            Error::Rpc(status) => status,
            Error::Cancelled => tonic::Status::cancelled(message),
            _ => tonic::Status::internal(message),
        }
    }
}
