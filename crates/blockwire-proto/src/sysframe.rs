//! System frame payloads.
//!
//! A frame with the `SYSTEM_FRAME` flag carries control traffic instead of
//! block data. The first payload byte selects the subtype:
//!
//! | code | payload |
//! |------|---------|
//! | 1 | memory block info: identity and size of one block |
//! | 2 | acknowledge: receiver's wrapping 16-bit byte count |
//! | 3 | remove-mblk request: ids the peer should forget |
//! | 4 | authentication data: user, device, network, password |
//!
//! Strings are UTF-8 with a 1-byte length prefix. Integers that vary in
//! width record their width in the accompanying flags byte.

use crate::{error::ProtocolError, Result};

/// Subtype byte: memory block info.
pub const SYS_MBLK_INFO: u8 = 1;
/// Subtype byte: acknowledge / keepalive.
pub const SYS_ACKNOWLEDGE: u8 = 2;
/// Subtype byte: remove-mblk request.
pub const SYS_REMOVE_MBLK_REQUEST: u8 = 3;
/// Subtype byte: authentication data.
pub const SYS_AUTHENTICATION_DATA: u8 = 4;

/// Version/flags byte of the mbinfo payload.
mod info_bits {
    /// device_nr field is two bytes
    pub const D_2BYTES: u8 = 0x01;
    /// nbytes field is two bytes
    pub const N_2BYTES: u8 = 0x02;
    /// mblk flags field is two bytes
    pub const F_2BYTES: u8 = 0x04;
    /// device name string present
    pub const HAS_DNAME: u8 = 0x08;
    /// mblk name string present
    pub const HAS_MBNAME: u8 = 0x10;
}

/// Authentication flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthFlags(u8);

impl AuthFlags {
    /// device_nr field is two bytes
    pub const DEVICE_NR_2_BYTES: u8 = 0x01;
    /// device_nr field is four bytes
    pub const DEVICE_NR_4_BYTES: u8 = 0x02;
    /// a 16-byte unique id follows the device number
    pub const UNIQUE_ID: u8 = 0x04;
    /// initiator connects upwards (toward the controller)
    pub const CONNECT_UP: u8 = 0x08;
    /// connection crosses a cloud gateway
    pub const CLOUD_CON: u8 = 0x10;
    /// client asks the server to send its trust certificate
    pub const CERTIFICATE_REQUEST: u8 = 0x20;

    /// Empty flag set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Wrap a raw byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Test bits.
    #[must_use]
    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    /// Set bits.
    pub fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    /// Clear bits.
    pub fn remove(&mut self, bits: u8) {
        self.0 &= !bits;
    }
}

/// Memory block identity as announced to a peer.
///
/// Emitted when a new block appears or a connection comes up. The frame
/// header's mblk id field carries the announcing side's own id for the
/// block, which the receiver stores as the remote id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MblkInfo {
    /// Device number (0 = unset, `AUTO_DEVICE_NR` sentinel = requesting)
    pub device_nr: u32,
    /// Block size in bytes
    pub nbytes: u32,
    /// Serialized block flags (direction, resize, static, ...)
    pub flags: u16,
    /// Device name; empty = absent on the wire
    pub device_name: String,
    /// Block name; empty = absent on the wire
    pub mblk_name: String,
}

/// Authentication payload: the first protocol frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    /// Flag bits (field widths and connection policy)
    pub flags: AuthFlags,
    /// User name; device identity for IO boards
    pub user_name: String,
    /// Device number; `AUTO_DEVICE_NR` requests automatic numbering
    pub device_nr: u32,
    /// Unique 16-byte id of the connecting hardware, if it has one
    pub unique_id: Option<[u8; 16]>,
    /// IO network name the peer belongs to / wants to join
    pub network_name: String,
    /// Password, possibly empty
    pub password: String,
}

/// Decoded system frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemFrame {
    /// Memory block identity announcement
    MblkInfo(MblkInfo),
    /// Flow-control acknowledge carrying the receive counter
    Acknowledge {
        /// Receiver's `bytes_received`, modulo 2^16
        bytes_received: u16,
    },
    /// Ask the peer to forget these block ids (its own local ids)
    RemoveMblkRequest {
        /// Ids as known on the receiving side
        remote_ids: Vec<u16>,
    },
    /// Authentication data
    Authentication(AuthData),
}

impl SystemFrame {
    /// Encode into a payload buffer (subtype byte included).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::StringTooLong`] for oversized name fields
    /// - [`ProtocolError::ValueTooWide`] if a count/number overflows its field
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::MblkInfo(info) => {
                out.push(SYS_MBLK_INFO);
                let flags_at = out.len();
                out.push(0);
                let mut bits = 0u8;
                if put_var16(out, info.device_nr, "device_nr")? {
                    bits |= info_bits::D_2BYTES;
                }
                if put_var16(out, info.nbytes, "nbytes")? {
                    bits |= info_bits::N_2BYTES;
                }
                if put_var16(out, u32::from(info.flags), "mblk_flags")? {
                    bits |= info_bits::F_2BYTES;
                }
                if !info.device_name.is_empty() {
                    put_str(out, &info.device_name, "device_name")?;
                    bits |= info_bits::HAS_DNAME;
                }
                if !info.mblk_name.is_empty() {
                    put_str(out, &info.mblk_name, "mblk_name")?;
                    bits |= info_bits::HAS_MBNAME;
                }
                out[flags_at] = bits;
            }
            Self::Acknowledge { bytes_received } => {
                out.push(SYS_ACKNOWLEDGE);
                out.push(*bytes_received as u8);
                out.push((*bytes_received >> 8) as u8);
            }
            Self::RemoveMblkRequest { remote_ids } => {
                out.push(SYS_REMOVE_MBLK_REQUEST);
                let count = u8::try_from(remote_ids.len()).map_err(|_| {
                    ProtocolError::ValueTooWide {
                        field: "remove_count",
                        value: remote_ids.len() as u64,
                    }
                })?;
                out.push(count);
                for id in remote_ids {
                    out.push(*id as u8);
                    out.push((*id >> 8) as u8);
                }
            }
            Self::Authentication(auth) => {
                out.push(SYS_AUTHENTICATION_DATA);
                let mut flags = auth.flags;
                let flags_at = out.len();
                out.push(0);
                put_str(out, &auth.user_name, "user_name")?;
                match auth.device_nr {
                    0..=0xFF => out.push(auth.device_nr as u8),
                    0x100..=0xFFFF => {
                        out.push(auth.device_nr as u8);
                        out.push((auth.device_nr >> 8) as u8);
                        flags.insert(AuthFlags::DEVICE_NR_2_BYTES);
                    }
                    _ => {
                        out.extend_from_slice(&auth.device_nr.to_le_bytes());
                        flags.insert(AuthFlags::DEVICE_NR_4_BYTES);
                    }
                }
                if let Some(id) = &auth.unique_id {
                    out.extend_from_slice(id);
                    flags.insert(AuthFlags::UNIQUE_ID);
                }
                put_str(out, &auth.network_name, "network_name")?;
                put_str(out, &auth.password, "password")?;
                out[flags_at] = flags.to_byte();
            }
        }
        Ok(())
    }

    /// Decode a system frame payload (subtype byte first).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownSystemFrame`] for unrecognized subtypes
    /// - [`ProtocolError::Truncated`] when a field runs past the payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let subtype = r.u8("subtype")?;
        match subtype {
            SYS_MBLK_INFO => {
                let bits = r.u8("info_flags")?;
                let device_nr = r.var16(bits & info_bits::D_2BYTES != 0, "device_nr")?;
                let nbytes = r.var16(bits & info_bits::N_2BYTES != 0, "nbytes")?;
                let flags = r.var16(bits & info_bits::F_2BYTES != 0, "mblk_flags")?;
                let device_name = if bits & info_bits::HAS_DNAME != 0 {
                    r.string("device_name")?
                } else {
                    String::new()
                };
                let mblk_name = if bits & info_bits::HAS_MBNAME != 0 {
                    r.string("mblk_name")?
                } else {
                    String::new()
                };
                Ok(Self::MblkInfo(MblkInfo {
                    device_nr: u32::from(device_nr),
                    nbytes: u32::from(nbytes),
                    flags,
                    device_name,
                    mblk_name,
                }))
            }
            SYS_ACKNOWLEDGE => {
                let lo = r.u8("ack_lo")?;
                let hi = r.u8("ack_hi")?;
                Ok(Self::Acknowledge { bytes_received: u16::from(lo) | (u16::from(hi) << 8) })
            }
            SYS_REMOVE_MBLK_REQUEST => {
                let count = r.u8("remove_count")?;
                let mut remote_ids = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let lo = r.u8("remove_id")?;
                    let hi = r.u8("remove_id")?;
                    remote_ids.push(u16::from(lo) | (u16::from(hi) << 8));
                }
                Ok(Self::RemoveMblkRequest { remote_ids })
            }
            SYS_AUTHENTICATION_DATA => {
                let mut flags = AuthFlags::from_byte(r.u8("auth_flags")?);
                let user_name = r.string("user_name")?;
                let device_nr = if flags.contains(AuthFlags::DEVICE_NR_4_BYTES) {
                    let b = r.take(4, "device_nr")?;
                    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
                } else if flags.contains(AuthFlags::DEVICE_NR_2_BYTES) {
                    u32::from(r.u8("device_nr")?) | (u32::from(r.u8("device_nr")?) << 8)
                } else {
                    u32::from(r.u8("device_nr")?)
                };
                let unique_id = if flags.contains(AuthFlags::UNIQUE_ID) {
                    let b = r.take(16, "unique_id")?;
                    let mut id = [0u8; 16];
                    id.copy_from_slice(b);
                    Some(id)
                } else {
                    None
                };
                let network_name = r.string("network_name")?;
                let password = r.string("password")?;
                // Width bits are represented structurally after decode.
                flags.remove(
                    AuthFlags::DEVICE_NR_2_BYTES
                        | AuthFlags::DEVICE_NR_4_BYTES
                        | AuthFlags::UNIQUE_ID,
                );
                Ok(Self::Authentication(AuthData {
                    flags,
                    user_name,
                    device_nr,
                    unique_id,
                    network_name,
                    password,
                }))
            }
            other => Err(ProtocolError::UnknownSystemFrame(other)),
        }
    }
}

/// Write a value as 1 or 2 little-endian bytes; true if 2 were written.
fn put_var16(out: &mut Vec<u8>, value: u32, field: &'static str) -> Result<bool> {
    let v = u16::try_from(value)
        .map_err(|_| ProtocolError::ValueTooWide { field, value: u64::from(value) })?;
    out.push(v as u8);
    if v > 0xFF {
        out.push((v >> 8) as u8);
        return Ok(true);
    }
    Ok(false)
}

fn put_str(out: &mut Vec<u8>, s: &str, field: &'static str) -> Result<()> {
    if s.len() > 255 {
        return Err(ProtocolError::StringTooLong(field));
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(ProtocolError::Truncated(field))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8]> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(ProtocolError::Truncated(field))?;
        self.pos += n;
        Ok(slice)
    }

    fn var16(&mut self, two: bool, field: &'static str) -> Result<u16> {
        let lo = self.u8(field)?;
        if two {
            let hi = self.u8(field)?;
            Ok(u16::from(lo) | (u16::from(hi) << 8))
        } else {
            Ok(u16::from(lo))
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String> {
        let len = usize::from(self.u8(field)?);
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::BadUtf8)
    }
}
