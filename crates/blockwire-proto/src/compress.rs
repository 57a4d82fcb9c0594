//! Run-length coding of frame payloads.
//!
//! Key frames carry raw block bytes; delta frames carry the XOR of the new
//! snapshot against the last transmitted one, which is mostly zeros. The
//! coder exploits exactly that: a chunked stream where each control byte
//! either marks a zero run or a literal run.
//!
//! ```text
//! control byte c:
//!   c & 0x80 set   -> (c & 0x7F) + 1 zero bytes        (1..=128)
//!   c & 0x80 clear -> c + 1 literal bytes follow       (1..=128)
//! ```
//!
//! If the encoding of a range is not strictly shorter than the raw bytes,
//! the sender transmits raw and clears the `COMPRESSED` flag; the decoder
//! never sees an expanded stream. When the output budget runs out
//! mid-range the encoder stops at a chunk boundary and reports how far it
//! got, so the next frame resumes from that address.

use crate::{error::ProtocolError, Result};

/// Outcome of packing a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackOutcome {
    /// Range (or a prefix of it) encoded smaller than the raw bytes.
    Encoded {
        /// The encoded stream, at most `max_out` bytes
        data: Vec<u8>,
        /// First address not covered by `data`; `end + 1` when the whole
        /// range fit
        next_addr: usize,
    },
    /// Encoding would not save space; send the raw bytes instead.
    Incompressible,
}

const MAX_RUN: usize = 128;

/// Pack `src[start..=end]` into at most `max_out` encoded bytes.
#[must_use]
pub fn pack_range(src: &[u8], start: usize, end: usize, max_out: usize) -> PackOutcome {
    debug_assert!(start <= end && end < src.len());

    let mut out: Vec<u8> = Vec::new();
    let mut pos = start;
    let mut full = false;

    while pos <= end && !full {
        let mut zeros = 0;
        while pos + zeros <= end && src[pos + zeros] == 0 {
            zeros += 1;
        }

        if zeros >= 2 {
            while zeros > 0 {
                if out.len() + 1 > max_out {
                    full = true;
                    break;
                }
                let run = zeros.min(MAX_RUN);
                out.push(0x80 | (run - 1) as u8);
                pos += run;
                zeros -= run;
            }
        } else {
            // Literal stretch: runs until a zero run of at least two bytes.
            let mut i = pos;
            while i <= end && i - pos < MAX_RUN {
                if src[i] == 0 && i < end && src[i + 1] == 0 {
                    break;
                }
                i += 1;
            }
            let space = max_out.saturating_sub(out.len());
            if space < 2 {
                full = true;
                break;
            }
            let lit_len = (i - pos).min(space - 1);
            out.push((lit_len - 1) as u8);
            out.extend_from_slice(&src[pos..pos + lit_len]);
            pos += lit_len;
        }
    }

    let consumed = pos - start;
    if consumed == 0 || out.len() >= consumed {
        PackOutcome::Incompressible
    } else {
        PackOutcome::Encoded { data: out, next_addr: pos }
    }
}

/// Decode an encoded stream into `dst`, which starts at the frame address.
///
/// With `delta` set the decoded bytes are XORed into `dst` (zero runs leave
/// the destination untouched); otherwise they overwrite it.
///
/// Returns the number of destination bytes covered.
///
/// # Errors
///
/// - [`ProtocolError::RangeOverflow`] if a run extends past `dst`
/// - [`ProtocolError::BadCompressedData`] if a literal run is truncated
pub fn unpack_into(src: &[u8], dst: &mut [u8], delta: bool) -> Result<usize> {
    let mut si = 0;
    let mut di = 0;

    while si < src.len() {
        let control = src[si];
        si += 1;
        if control & 0x80 != 0 {
            let run = usize::from(control & 0x7F) + 1;
            if di + run > dst.len() {
                return Err(ProtocolError::RangeOverflow);
            }
            if !delta {
                dst[di..di + run].fill(0);
            }
            di += run;
        } else {
            let n = usize::from(control) + 1;
            if si + n > src.len() {
                return Err(ProtocolError::BadCompressedData);
            }
            if di + n > dst.len() {
                return Err(ProtocolError::RangeOverflow);
            }
            if delta {
                for k in 0..n {
                    dst[di + k] ^= src[si + k];
                }
            } else {
                dst[di..di + n].copy_from_slice(&src[si..si + n]);
            }
            si += n;
            di += n;
        }
    }

    Ok(di)
}

/// Apply an uncompressed payload to `dst` (the `COMPRESSED`-clear path).
///
/// # Errors
///
/// - [`ProtocolError::RangeOverflow`] if the payload extends past `dst`
pub fn apply_raw(payload: &[u8], dst: &mut [u8], delta: bool) -> Result<usize> {
    if payload.len() > dst.len() {
        return Err(ProtocolError::RangeOverflow);
    }
    if delta {
        for (d, &s) in dst.iter_mut().zip(payload) {
            *d ^= s;
        }
    } else {
        dst[..payload.len()].copy_from_slice(payload);
    }
    Ok(payload.len())
}
