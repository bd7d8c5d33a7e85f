use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised by the framing, descriptor-passing and connection layers.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Zero-length frames may only be received, never written.
    #[error("refusing to write an empty frame")]
    EmptyFrame,

    /// The length prefix accumulated past the configured maximum.
    #[error("frame length exceeds the limit of {limit} bytes")]
    LengthTooLarge { limit: usize },

    /// The peer closed the connection in the middle of a length prefix.
    #[error("connection closed in the middle of a length prefix")]
    TruncatedLength,

    /// A declared payload did not arrive in full before the read deadline.
    #[error("aborted message: received {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    /// The kernel accepted fewer bytes than the frame holds.
    #[error("transport interrupted: wrote {written} of {expected} bytes")]
    TransportInterrupted { written: usize, expected: usize },

    /// The peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Ancillary data carried a descriptor count other than one.
    #[error("expected exactly one descriptor, received {0}")]
    DescriptorCount(usize),

    /// The kernel truncated the ancillary data.
    #[error("ancillary data was truncated")]
    DescriptorTruncated,

    /// Ancillary data held something other than `SCM_RIGHTS`.
    #[error("unexpected control message (level {level}, type {kind})")]
    UnexpectedControlMessage { level: i32, kind: i32 },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gave up connecting to {} after {attempts} attempts", path.display())]
    RetriesExhausted { path: PathBuf, attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[cfg(unix)]
    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
}

/// Coarse classification of an [`IpcError`], used to decide whether a failure
/// ends a connection quietly, loudly, or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The peer went away. Expected, not logged as an error.
    Graceful,
    /// A syscall on the transport failed.
    Transport,
    /// The peer violated the framing or descriptor protocol.
    Protocol,
    /// A cancellation signal stopped the operation.
    Cancelled,
    /// Connection retries ran out.
    Exhausted,
}

impl IpcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IpcError::PeerClosed => ErrorClass::Graceful,
            IpcError::EmptyFrame
            | IpcError::LengthTooLarge { .. }
            | IpcError::TruncatedLength
            | IpcError::ShortRead { .. }
            | IpcError::DescriptorCount(_)
            | IpcError::DescriptorTruncated
            | IpcError::UnexpectedControlMessage { .. } => ErrorClass::Protocol,
            IpcError::Cancelled => ErrorClass::Cancelled,
            IpcError::RetriesExhausted { .. } => ErrorClass::Exhausted,
            IpcError::TransportInterrupted { .. }
            | IpcError::Timeout(_)
            | IpcError::NotConnected
            | IpcError::Connect { .. }
            | IpcError::Bind { .. }
            | IpcError::Accept(_)
            | IpcError::Io(_) => ErrorClass::Transport,
            #[cfg(unix)]
            IpcError::Sys(_) => ErrorClass::Transport,
        }
    }

    /// True when the peer simply hung up.
    pub fn is_graceful(&self) -> bool {
        self.class() == ErrorClass::Graceful
    }
}

pub type Result<T, E = IpcError> = std::result::Result<T, E>;
