//! Error and progress types for the replication engine.
//!
//! Every fallible core operation returns an explicit status; there is no
//! hidden control flow. Non-error outcomes that callers still need to
//! distinguish (nothing to do, partial progress) live in [`Progress`], so
//! `Result<Progress, FabricError>` tells the whole story of one call.

use thiserror::Error;

use blockwire_proto::ProtocolError;

/// Non-error outcome of a polled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation completed its work
    Done,
    /// Work remains; call again on the next tick
    Pending,
    /// There was nothing to do
    NothingToDo,
    /// A multi-step operation reached its terminal step
    Completed,
}

impl Progress {
    /// True if the caller should come back for more.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Error kinds surfaced by the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    /// Generic failure
    #[error("operation failed")]
    Failed,

    /// Memory or id space could not be allocated
    #[error("allocation failed")]
    MemoryAllocation,

    /// Serial frame failed its checksum
    #[error("checksum error")]
    Checksum,

    /// The underlying stream was closed
    #[error("stream closed")]
    StreamClosed,

    /// The peer refused the connection
    #[error("connection refused")]
    ConnectionRefused,

    /// The connection was reset mid-stream
    #[error("connection reset")]
    ConnectionReset,

    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,

    /// The server certificate was rejected
    #[error("server certificate rejected")]
    ServerCertRejected,

    /// A buffer or queue is out of space
    #[error("out of buffer space")]
    OutOfBuffer,

    /// The operation is not supported by this object's flags
    #[error("not supported")]
    NotSupported,

    /// A wire-format violation; connection-fatal
    #[error("protocol violation: {0}")]
    Protocol(ProtocolError),
}

impl FabricError {
    /// True for errors that fail a single connection rather than the call
    /// that observed them.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Checksum
                | Self::StreamClosed
                | Self::ConnectionRefused
                | Self::ConnectionReset
                | Self::Protocol(_)
        )
    }
}

impl From<ProtocolError> for FabricError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ChecksumMismatch { .. } => Self::Checksum,
            other => Self::Protocol(other),
        }
    }
}
