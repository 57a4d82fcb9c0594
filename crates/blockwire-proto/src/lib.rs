//! Wire layer for the Blockwire replication fabric.
//!
//! This crate is pure data plumbing: it encodes and decodes the framed wire
//! protocol that carries memory-block updates between a device and its
//! controller. There is no I/O here and no protocol state beyond what a
//! single codec needs; the connection state machine lives in
//! `blockwire-core`.
//!
//! Layout on the wire (multi-byte integers little-endian, fields
//! variable-width by flag bits):
//!
//! ```text
//! [frame_nr]         serial transport only
//! [checksum lo, hi]  serial transport only (Fletcher-16, field zeroed)
//! [flags]
//! [data_sz lo]       [data_sz hi] on socket transports
//! [mblk_id lo]       [mblk_id hi] iff MBLK_HAS_TWO_BYTES
//! [addr ...]         1, 2 or 4 bytes by ADDR_HAS_* flags
//! [payload ...]
//! ```

pub mod checksum;
pub mod compress;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod sysframe;

pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FrameHeader, FrameReader, Transport, MAX_FRAME_NR};
pub use sysframe::{AuthData, AuthFlags, MblkInfo, SystemFrame};

/// Result alias used throughout the wire layer.
pub type Result<T> = std::result::Result<T, ProtocolError>;
