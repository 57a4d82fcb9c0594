//! Source buffer: per-(block, connection) outbound mirror.
//!
//! Local writes widen the buffer's invalidated range. `synchronize` turns
//! that range into one in-flight snapshot: the reference copy is updated
//! to the new content and the wire image (raw bytes for a key frame, XOR
//! against the previous reference for a delta frame) is staged. The
//! connection then drains the snapshot into one or more frames, honoring
//! its send credit; only after the last frame does the next snapshot
//! begin, so a receiver never sees two snapshots interleaved.
//!
//! Static blocks carry no shadow at all - their content is the reference
//! and every send is a key frame.

use crate::mblk::MblkId;

/// Invalidated (changed but not yet snapshotted) address range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InvalidatedRange {
    set: bool,
    start: usize,
    end: usize,
}

impl InvalidatedRange {
    pub fn widen(&mut self, start: usize, end: usize) {
        if self.set {
            self.start = self.start.min(start);
            self.end = self.end.max(end);
        } else {
            self.set = true;
            self.start = start;
            self.end = end;
        }
    }

    pub fn take(&mut self) -> Option<(usize, usize)> {
        if self.set {
            self.set = false;
            Some((self.start, self.end))
        } else {
            None
        }
    }

    pub fn is_set(&self) -> bool {
        self.set
    }
}

/// Outbound mirror of one block toward one connection.
pub(crate) struct SourceBuffer {
    /// Local block this buffer drains
    pub mblk_id: MblkId,
    /// Id by which the peer knows the block; stamped into frame headers
    pub remote_mblk_id: MblkId,
    /// Static blocks have no shadow; content is the reference
    pub is_static: bool,
    changed: InvalidatedRange,
    /// Last-synchronized content (the delta reference)
    ref_buf: Vec<u8>,
    /// Wire image of the current snapshot
    delta_buf: Vec<u8>,
    used: bool,
    make_keyframe: bool,
    is_keyframe: bool,
    start: usize,
    end: usize,
}

impl SourceBuffer {
    /// New buffer for a block of `nbytes`. The whole block is invalidated
    /// and the first snapshot is forced to be a key frame, so a fresh
    /// attachment (or a reconnect) never relies on peer state.
    pub fn new(mblk_id: MblkId, remote_mblk_id: MblkId, nbytes: usize, is_static: bool) -> Self {
        let mut sbuf = Self {
            mblk_id,
            remote_mblk_id,
            is_static,
            changed: InvalidatedRange::default(),
            ref_buf: if is_static { Vec::new() } else { vec![0; nbytes] },
            delta_buf: if is_static { Vec::new() } else { vec![0; nbytes] },
            used: false,
            make_keyframe: true,
            is_keyframe: false,
            start: 0,
            end: 0,
        };
        sbuf.changed.widen(0, nbytes.saturating_sub(1));
        sbuf
    }

    /// Mark `[start, end]` as changed.
    pub fn invalidate(&mut self, start: usize, end: usize) {
        self.changed.widen(start, end);
    }

    /// Whether a snapshot is currently in flight.
    pub fn in_flight(&self) -> bool {
        self.used
    }

    /// Whether there are changes waiting for the next snapshot.
    pub fn has_pending_changes(&self) -> bool {
        self.changed.is_set()
    }

    /// Request the next snapshot to be a key frame (reconnect, refused
    /// delta).
    pub fn request_keyframe(&mut self) {
        self.make_keyframe = true;
    }

    /// Snapshot pending changes for sending.
    ///
    /// Returns true if a new snapshot became available. No-op while a
    /// previous snapshot is still in flight - at most one snapshot exists
    /// at any time.
    pub fn synchronize(&mut self, block_data: &[u8]) -> bool {
        if self.used {
            return false;
        }
        let Some((start, end)) = self.changed.take() else {
            return false;
        };
        let mut limit = block_data.len();
        if !self.is_static {
            limit = limit.min(self.ref_buf.len());
        }
        if limit == 0 {
            return false;
        }
        let end = end.min(limit - 1);
        let start = start.min(end);

        self.is_keyframe = self.make_keyframe;
        self.make_keyframe = false;

        if !self.is_static {
            for i in start..=end {
                let new = block_data[i];
                self.delta_buf[i] = if self.is_keyframe { new } else { new ^ self.ref_buf[i] };
                self.ref_buf[i] = new;
            }
        } else {
            self.is_keyframe = true;
        }

        self.start = start;
        self.end = end;
        self.used = true;
        true
    }

    /// The staged wire image and whether it is delta encoded.
    ///
    /// For static blocks the caller passes the block content back in; the
    /// returned range is always raw (key frame).
    pub fn wire_image<'a>(&'a self, block_data: &'a [u8]) -> (&'a [u8], bool) {
        if self.is_static {
            (block_data, false)
        } else {
            (&self.delta_buf, !self.is_keyframe)
        }
    }

    /// Remaining snapshot range, while in flight.
    pub fn pending_range(&self) -> Option<(usize, usize)> {
        self.used.then_some((self.start, self.end))
    }

    /// Advance past bytes emitted into a frame. Returns true when the
    /// snapshot completed (the frame must carry `SYNC_COMPLETE`).
    pub fn advance(&mut self, next_addr: usize) -> bool {
        debug_assert!(self.used);
        self.start = next_addr;
        if self.start > self.end {
            self.used = false;
            true
        } else {
            false
        }
    }
}
