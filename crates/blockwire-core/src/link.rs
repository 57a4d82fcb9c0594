//! Byte-stream capability traits.
//!
//! The engine never owns sockets or serial ports; it drives whatever
//! implements [`Link`]. All calls are non-blocking: a read or write that
//! cannot make progress returns `Ok(0)` and the connection retries on its
//! next tick. TLS, TCP and serial implementations live with the
//! application (or the test harness); the core only states the contract.

use crate::error::FabricError;

/// A non-blocking, bidirectional byte stream.
pub trait Link: Send {
    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when no data is available right now.
    ///
    /// # Errors
    ///
    /// - [`FabricError::StreamClosed`] once the peer is gone
    /// - [`FabricError::ConnectionReset`] on a mid-stream reset
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FabricError>;

    /// Write up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when the stream cannot accept data right now.
    ///
    /// # Errors
    ///
    /// - [`FabricError::StreamClosed`] once the peer is gone
    /// - [`FabricError::ConnectionRefused`] for a late connect failure
    fn write(&mut self, buf: &[u8]) -> Result<usize, FabricError>;

    /// Push buffered bytes toward the peer.
    ///
    /// # Errors
    ///
    /// Same kinds as [`Link::write`].
    fn flush(&mut self) -> Result<(), FabricError>;

    /// Close the stream. Never fails; errors on close are uninteresting.
    fn close(&mut self);
}

/// A listening stream producing accepted [`Link`]s.
pub trait Acceptor: Send {
    /// Accept one pending connection, if any.
    ///
    /// Returns `Ok(None)` when nothing is waiting.
    ///
    /// # Errors
    ///
    /// - [`FabricError::StreamClosed`] if the listener itself died
    fn accept(&mut self) -> Result<Option<Box<dyn Link>>, FabricError>;
}

/// Factory recreating a [`Link`] for reconnecting initiator connections.
pub type Connector = Box<dyn FnMut() -> Result<Box<dyn Link>, FabricError> + Send>;
