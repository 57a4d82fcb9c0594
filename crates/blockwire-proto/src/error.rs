//! Error types for the wire layer.
//!
//! Every decode failure is represented explicitly; the core maps these onto
//! its connection-fatal error kinds. We avoid `std::io::Error` here - the
//! wire layer never touches a stream.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a complete field
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// Serial frame checksum did not match
    #[error("checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame
        expected: u16,
        /// Checksum computed over the received bytes
        computed: u16,
    },

    /// Serial frame number was not the successor of the previous one
    #[error("frame number gap: expected {expected}, received {received}")]
    FrameNumberGap {
        /// Next frame number the decoder would accept
        expected: u8,
        /// Frame number actually received
        received: u8,
    },

    /// Reserved flag bits were set
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlagBits(u8),

    /// Payload does not fit the width of the size field
    #[error("payload of {size} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Requested payload size
        size: usize,
        /// Maximum the transport's size field can carry
        max: usize,
    },

    /// A value does not fit its variable-width wire field
    #[error("value {value} does not fit {field}")]
    ValueTooWide {
        /// Field being encoded
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// String field longer than its 1-byte length prefix allows
    #[error("string field {0} longer than 255 bytes")]
    StringTooLong(&'static str),

    /// String field held invalid UTF-8
    #[error("string field is not valid UTF-8")]
    BadUtf8,

    /// Unknown system frame subtype byte
    #[error("unknown system frame subtype {0:#04x}")]
    UnknownSystemFrame(u8),

    /// Decompressed data would overrun the target range
    #[error("decoded run overflows the destination range")]
    RangeOverflow,

    /// Malformed RLE stream
    #[error("malformed compressed stream")]
    BadCompressedData,

    /// Handshake first byte carried an unknown process type
    #[error("unknown handshake type byte {0:#04x}")]
    BadHandshakeType(u8),
}
