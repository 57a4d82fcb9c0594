//! Memory block: the unit of replication.
//!
//! A memory block is a named byte array whose authoritative copy lives on
//! one side ("up") and is mirrored on the other ("down"). Writes record an
//! invalidated address range; attached source buffers snapshot that range
//! and feed it to their connections. The block itself knows nothing about
//! framing - it is bytes, identity, flags and callbacks.

use crate::{
    connection::ConnId,
    error::{FabricError, Progress},
};

/// Process-unique memory block identifier. Wire frames carry it in one or
/// two bytes.
pub type MblkId = u16;

/// Smallest id handed out; 0 marks "unset" and 1..=7 are reserved.
pub const MIN_MBLK_ID: MblkId = 8;
/// Largest id handed out; the range above is reserved.
pub const MAX_MBLK_ID: MblkId = 0x7FFF;
/// Minimum block size in bytes.
pub const MIN_MBLK_SZ: usize = 24;
/// Maximum device/block name length (ASCII).
pub const NAME_MAX: usize = 15;
/// Maximum network name length (ASCII).
pub const NETWORK_NAME_MAX: usize = 23;

/// Memory block flag bits. The low ten bits are serialized into mbinfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MblkFlags(u16);

impl MblkFlags {
    /// Mirrored copy: data flows into this block
    pub const DOWN: u16 = 0x0001;
    /// Authoritative copy: data flows out of this block
    pub const UP: u16 = 0x0002;
    /// Synchronize on every write instead of waiting for an explicit send
    pub const AUTO_SYNC: u16 = 0x0004;
    /// Writes propagate both ways with per-byte change tracking
    pub const BIDIRECTIONAL: u16 = 0x0008;
    /// Materialized by discovery; released when last attachment drops
    pub const DYNAMIC: u16 = 0x0010;
    /// Allow growing to the size announced by the peer
    pub const ALLOW_RESIZE: u16 = 0x0020;
    /// Immutable content, never delta-synchronized
    pub const STATIC: u16 = 0x0040;
    /// Transferred only between local server and cloud server
    pub const CLOUD_ONLY: u16 = 0x0080;
    /// Never transferred through a cloud connection
    pub const NO_CLOUD: u16 = 0x0100;
    /// Bottom of the block hierarchy; never announced downwards
    pub const FLOOR: u16 = 0x0200;

    /// Empty flag set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Wrap raw bits.
    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bits (mbinfo serialization).
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Test bits.
    #[must_use]
    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    /// Set bits.
    #[must_use]
    pub fn with(mut self, bits: u16) -> Self {
        self.0 |= bits;
        self
    }

    /// Direction helper.
    #[must_use]
    pub fn is_up(self) -> bool {
        self.contains(Self::UP)
    }

    /// Direction helper.
    #[must_use]
    pub fn is_down(self) -> bool {
        self.contains(Self::DOWN)
    }
}

/// Endian handling for multi-byte values in a block.
///
/// Block content is little-endian on the wire and in memory. On big-endian
/// hosts, reads and writes of typed data ask for the group size so the
/// bytes can be swapped in flight; on little-endian hosts every variant is
/// a plain copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Swap {
    /// Plain byte copy
    #[default]
    None,
    /// Swap every 2-byte group on big-endian hosts
    Swap16,
    /// Swap every 4-byte group on big-endian hosts
    Swap32,
    /// Swap every 8-byte group on big-endian hosts
    Swap64,
}

impl Swap {
    fn group(self) -> usize {
        match self {
            Self::None => 1,
            Self::Swap16 => 2,
            Self::Swap32 => 4,
            Self::Swap64 => 8,
        }
    }
}

/// Copy bytes, swapping group byte order on big-endian hosts.
pub fn byte_ordered_copy(dst: &mut [u8], src: &[u8], swap: Swap) {
    debug_assert_eq!(dst.len(), src.len());
    let group = swap.group();
    if cfg!(target_endian = "little") || group == 1 {
        dst.copy_from_slice(src);
        return;
    }
    let mut i = 0;
    while i + group <= src.len() {
        for k in 0..group {
            dst[i + k] = src[i + group - 1 - k];
        }
        i += group;
    }
    // Trailing partial group copies straight through.
    if i < src.len() {
        dst[i..].copy_from_slice(&src[i..]);
    }
}

/// Why a block callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// The local application wrote the range
    LocalWrite,
    /// The range arrived from a connection
    Received,
}

/// Range handed to block callbacks.
#[derive(Debug)]
pub struct BlockChange<'a> {
    /// First changed address
    pub start: usize,
    /// Last changed address (inclusive)
    pub end: usize,
    /// Local write or received data
    pub reason: ChangeReason,
    /// Block content covering `start..=end`
    pub data: &'a [u8],
}

/// Callback invoked on local writes and received data.
///
/// Callbacks run inside the registry operation that produced the change
/// and must not block.
pub type BlockCallback = Box<dyn FnMut(&BlockChange<'_>) + Send>;

/// Handle to a memory block inside a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) id: MblkId,
}

impl BlockHandle {
    /// Block id this handle refers to.
    #[must_use]
    pub fn id(self) -> MblkId {
        self.id
    }
}

/// Parameters for creating a memory block.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockParams<'a> {
    /// Block name, at most 15 ASCII characters ("exp", "imp", "info")
    pub mblk_name: &'a str,
    /// Device type name, at most 15 ASCII characters ("GINA")
    pub device_name: &'a str,
    /// Device number; `AUTO_DEVICE_NR` requests automatic numbering
    pub device_nr: u32,
    /// IO network name, at most 23 ASCII characters
    pub network_name: &'a str,
    /// Data size in bytes; at least [`MIN_MBLK_SZ`] unless static content
    /// dictates the size
    pub nbytes: usize,
    /// Block flags; exactly one of `UP`/`DOWN` unless bidirectional
    pub flags: MblkFlags,
    /// Initial content for static blocks
    pub content: Option<&'a [u8]>,
}

/// One replicated byte array.
pub(crate) struct MemoryBlock {
    pub id: MblkId,
    pub mblk_name: String,
    pub device_name: String,
    pub device_nr: u32,
    pub network_name: String,
    pub flags: MblkFlags,
    pub data: Vec<u8>,
    /// Connections holding a source buffer for this block
    pub sbuf_conns: Vec<ConnId>,
    /// Connections holding a target buffer for this block
    pub tbuf_conns: Vec<ConnId>,
    pub callbacks: Vec<BlockCallback>,
    pub to_be_deleted: bool,
}

impl MemoryBlock {
    pub fn new(id: MblkId, prm: &MemoryBlockParams<'_>) -> Result<Self, FabricError> {
        if prm.mblk_name.is_empty()
            || prm.mblk_name.len() > NAME_MAX
            || prm.device_name.len() > NAME_MAX
            || prm.network_name.len() > NETWORK_NAME_MAX
        {
            return Err(FabricError::NotSupported);
        }

        let is_static = prm.flags.contains(MblkFlags::STATIC);
        if is_static && (!prm.flags.is_up() || prm.content.is_none()) {
            // Static content always lives on the authoritative side.
            return Err(FabricError::NotSupported);
        }

        let data = if let Some(content) = prm.content {
            content.to_vec()
        } else {
            let nbytes = prm.nbytes.max(MIN_MBLK_SZ);
            vec![0u8; nbytes]
        };
        if data.is_empty() {
            return Err(FabricError::NotSupported);
        }

        Ok(Self {
            id,
            mblk_name: prm.mblk_name.to_string(),
            device_name: prm.device_name.to_string(),
            device_nr: prm.device_nr,
            network_name: prm.network_name.to_string(),
            flags: prm.flags,
            data,
            sbuf_conns: Vec::new(),
            tbuf_conns: Vec::new(),
            callbacks: Vec::new(),
            to_be_deleted: false,
        })
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MblkFlags::STATIC)
    }

    /// Copy `src` into the block at `addr`, clipping to the block size.
    ///
    /// Returns the changed range, or `None` if the write fell entirely
    /// outside the block.
    pub fn write_bytes(&mut self, addr: usize, src: &[u8], swap: Swap) -> Option<(usize, usize)> {
        if addr >= self.data.len() || src.is_empty() {
            return None;
        }
        let n = src.len().min(self.data.len() - addr);
        byte_ordered_copy(&mut self.data[addr..addr + n], &src[..n], swap);
        Some((addr, addr + n - 1))
    }

    /// String write: copy up to `n` bytes of `s`, zero-filling the rest of
    /// the `n`-byte field.
    pub fn write_str(&mut self, addr: usize, n: usize, s: &str) -> Option<(usize, usize)> {
        if addr >= self.data.len() || n == 0 {
            return None;
        }
        let n = n.min(self.data.len() - addr);
        let count = s.len().min(n);
        self.data[addr..addr + count].copy_from_slice(&s.as_bytes()[..count]);
        self.data[addr + count..addr + n].fill(0);
        Some((addr, addr + n - 1))
    }

    /// Zero `n` bytes starting at `addr`, clipped to the block.
    pub fn clear_range(&mut self, addr: usize, n: usize) -> Option<(usize, usize)> {
        if addr >= self.data.len() || n == 0 {
            return None;
        }
        let n = n.min(self.data.len() - addr);
        self.data[addr..addr + n].fill(0);
        Some((addr, addr + n - 1))
    }

    /// Copy block content at `addr` into `out`, zero-filling anything past
    /// the end of the block.
    pub fn read_bytes(&self, addr: usize, out: &mut [u8], swap: Swap) {
        if addr >= self.data.len() {
            out.fill(0);
            return;
        }
        let n = out.len().min(self.data.len() - addr);
        byte_ordered_copy(&mut out[..n], &self.data[addr..addr + n], swap);
        out[n..].fill(0);
    }

    /// Read a zero-terminated string of at most `max` bytes from `addr`.
    pub fn read_str(&self, addr: usize, max: usize) -> String {
        if addr >= self.data.len() {
            return String::new();
        }
        let mut end = addr;
        let limit = (addr + max).min(self.data.len());
        while end < limit && self.data[end] != 0 {
            end += 1;
        }
        String::from_utf8_lossy(&self.data[addr..end]).into_owned()
    }

    /// Fire callbacks for a changed range.
    pub fn invoke_callbacks(&mut self, start: usize, end: usize, reason: ChangeReason) {
        if self.callbacks.is_empty() {
            return;
        }
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let change = BlockChange { start, end, reason, data: &self.data[start..=end] };
        for cb in &mut callbacks {
            cb(&change);
        }
        drop(change);
        // Callbacks registered during the walk would be lost; keep the
        // original list authoritative.
        self.callbacks = callbacks;
    }

    /// Grow to at least `nbytes` (peer announced a bigger block).
    pub fn resize_to(&mut self, nbytes: usize) -> Result<Progress, FabricError> {
        if nbytes <= self.data.len() {
            return Ok(Progress::NothingToDo);
        }
        if !self.flags.contains(MblkFlags::ALLOW_RESIZE) {
            return Err(FabricError::NotSupported);
        }
        self.data.resize(nbytes, 0);
        Ok(Progress::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(nbytes: usize) -> MemoryBlock {
        MemoryBlock::new(
            8,
            &MemoryBlockParams {
                mblk_name: "exp",
                device_name: "gina",
                device_nr: 1,
                network_name: "cafenet",
                nbytes,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                content: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn writes_clip_to_block_bounds() {
        let mut blk = block(32);
        assert_eq!(blk.write_bytes(30, &[1, 2, 3, 4], Swap::None), Some((30, 31)));
        assert_eq!(blk.data[30..], [1, 2]);
        assert_eq!(blk.write_bytes(32, &[1], Swap::None), None);
    }

    #[test]
    fn reads_zero_fill_past_end() {
        let mut blk = block(32);
        blk.write_bytes(28, &[9, 9, 9, 9], Swap::None);
        let mut out = [0xFFu8; 8];
        blk.read_bytes(28, &mut out, Swap::None);
        assert_eq!(out, [9, 9, 9, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn string_write_zero_fills_field() {
        let mut blk = block(32);
        blk.write_str(0, 8, "hi");
        assert_eq!(&blk.data[..8], b"hi\0\0\0\0\0\0");
        assert_eq!(blk.read_str(0, 8), "hi");

        blk.write_str(0, 4, "overlong");
        assert_eq!(&blk.data[..4], b"over");
    }

    #[test]
    fn clear_is_a_zero_write() {
        let mut blk = block(32);
        blk.write_bytes(0, &[1; 32], Swap::None);
        assert_eq!(blk.clear_range(8, 100), Some((8, 31)));
        assert!(blk.data[8..].iter().all(|&b| b == 0));
        assert!(blk.data[..8].iter().all(|&b| b == 1));
    }

    #[test]
    fn minimum_size_is_enforced() {
        let blk = block(4);
        assert_eq!(blk.nbytes(), MIN_MBLK_SZ);
    }

    #[test]
    fn static_requires_up_and_content() {
        let err = MemoryBlock::new(
            8,
            &MemoryBlockParams {
                mblk_name: "info",
                flags: MblkFlags::from_bits(MblkFlags::STATIC | MblkFlags::UP),
                content: None,
                ..Default::default()
            },
        );
        assert!(err.is_err());

        let ok = MemoryBlock::new(
            8,
            &MemoryBlockParams {
                mblk_name: "info",
                flags: MblkFlags::from_bits(MblkFlags::STATIC | MblkFlags::UP),
                content: Some(b"{}"),
                ..Default::default()
            },
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn callbacks_see_the_changed_slice() {
        use std::sync::{Arc, Mutex};

        let mut blk = block(32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        blk.callbacks.push(Box::new(move |change| {
            let mut guard = match seen2.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.push((change.start, change.end, change.data.to_vec()));
        }));

        blk.write_bytes(4, &[7, 8], Swap::None);
        blk.invoke_callbacks(4, 5, ChangeReason::LocalWrite);

        let guard = match seen.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert_eq!(&*guard, &[(4, 5, vec![7, 8])]);
    }

    #[test]
    fn resize_respects_the_flag() {
        let mut blk = block(32);
        assert_eq!(blk.resize_to(64), Err(FabricError::NotSupported));

        blk.flags = blk.flags.with(MblkFlags::ALLOW_RESIZE);
        assert_eq!(blk.resize_to(64), Ok(Progress::Completed));
        assert_eq!(blk.nbytes(), 64);
        assert_eq!(blk.resize_to(48), Ok(Progress::NothingToDo));
    }
}
