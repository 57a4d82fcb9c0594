//! Target buffer: per-(block, connection) inbound mirror.
//!
//! Incoming data frames assemble into a shadow copy; nothing touches the
//! memory block until a frame carries `SYNC_COMPLETE`. At that point the
//! assembled range moves to the ready stage, and the receive path promotes
//! it into the block atomically - so readers always observe a whole
//! snapshot, never a torn one.
//!
//! For bidirectional blocks a per-byte bitmap records which bytes the peer
//! actually sent, so echoing to other connections invalidates only those.

use blockwire_proto::{
    compress::{apply_raw, unpack_into},
    FrameFlags,
};

use crate::{error::FabricError, mblk::MblkId};

/// Inbound mirror of one block from one connection.
pub(crate) struct TargetBuffer {
    /// Local block this buffer feeds
    pub mblk_id: MblkId,
    /// The sender's own id for the block (used in remove requests)
    pub remote_mblk_id: MblkId,
    /// Shadow being assembled from incoming frames
    assembling: Vec<u8>,
    new_start: usize,
    new_end: usize,
    has_new_data: bool,
    /// Completed snapshot awaiting promotion
    ready: Vec<u8>,
    ready_start: usize,
    ready_end: usize,
    ready_used: bool,
    /// Per-byte received marks for bidirectional blocks
    received_bits: Option<Vec<u8>>,
    ready_bits: Option<Vec<u8>>,
}

impl TargetBuffer {
    pub fn new(mblk_id: MblkId, remote_mblk_id: MblkId, nbytes: usize, bidirectional: bool) -> Self {
        let bits = bidirectional.then(|| vec![0u8; nbytes.div_ceil(8)]);
        Self {
            mblk_id,
            remote_mblk_id,
            assembling: vec![0; nbytes],
            new_start: 0,
            new_end: 0,
            has_new_data: false,
            ready: vec![0; nbytes],
            ready_start: 0,
            ready_end: 0,
            ready_used: false,
            received_bits: bits.clone(),
            ready_bits: bits,
        }
    }

    pub fn nbytes(&self) -> usize {
        self.assembling.len()
    }

    /// Apply one data frame to the shadow.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Protocol`] wrapping range/stream violations
    pub fn apply_frame(
        &mut self,
        addr: usize,
        payload: &[u8],
        flags: FrameFlags,
    ) -> Result<(), FabricError> {
        if addr >= self.assembling.len() {
            return Err(FabricError::OutOfBuffer);
        }
        let delta = flags.contains(FrameFlags::DELTA_ENCODED);
        let dst = &mut self.assembling[addr..];
        let covered = if flags.contains(FrameFlags::COMPRESSED) {
            unpack_into(payload, dst, delta)?
        } else {
            apply_raw(payload, dst, delta)?
        };

        if covered > 0 {
            let end = addr + covered - 1;
            if self.has_new_data {
                self.new_start = self.new_start.min(addr);
                self.new_end = self.new_end.max(end);
            } else {
                self.has_new_data = true;
                self.new_start = addr;
                self.new_end = end;
            }
            if let Some(bits) = &mut self.received_bits {
                for i in addr..=end {
                    bits[i >> 3] |= 1 << (i & 7);
                }
            }
        }

        if flags.contains(FrameFlags::SYNC_COMPLETE) {
            self.complete_snapshot();
        }
        Ok(())
    }

    /// Move the assembled range into the ready stage.
    fn complete_snapshot(&mut self) {
        if !self.has_new_data {
            return;
        }
        let (start, end) = (self.new_start, self.new_end);
        if self.ready_used {
            // Consumer has not promoted the previous snapshot yet; merge.
            // The merged range may span a gap between the two snapshots;
            // the shadow holds every byte received so far, so copying the
            // whole union from it keeps the gap coherent.
            let union_start = self.ready_start.min(start);
            let union_end = self.ready_end.max(end);
            self.ready[union_start..=union_end]
                .copy_from_slice(&self.assembling[union_start..=union_end]);
            self.ready_start = union_start;
            self.ready_end = union_end;
        } else {
            self.ready[start..=end].copy_from_slice(&self.assembling[start..=end]);
            self.ready_used = true;
            self.ready_start = start;
            self.ready_end = end;
        }
        if let (Some(bits), Some(ready_bits)) = (&mut self.received_bits, &mut self.ready_bits) {
            for i in start..=end {
                let mask = 1 << (i & 7);
                if bits[i >> 3] & mask != 0 {
                    ready_bits[i >> 3] |= mask;
                    bits[i >> 3] &= !mask;
                }
            }
        }
        self.has_new_data = false;
    }

    /// Whether a completed snapshot awaits promotion.
    pub fn ready(&self) -> bool {
        self.ready_used
    }

    /// Take the completed snapshot for promotion into the block.
    ///
    /// The returned snapshot owns its bytes so the promotion path can walk
    /// other connections (echo fan-out) without holding a borrow here.
    pub fn take_ready(&mut self) -> Option<ReadySnapshot> {
        if !self.ready_used {
            return None;
        }
        self.ready_used = false;
        let (start, end) = (self.ready_start, self.ready_end);
        let bits = self.ready_bits.as_mut().map(|bits| {
            let taken: Vec<u8> = bits.clone();
            for i in start..=end {
                bits[i >> 3] &= !(1 << (i & 7));
            }
            taken
        });
        Some(ReadySnapshot {
            start,
            end,
            data: self.ready[start..=end].to_vec(),
            received_bits: bits,
        })
    }
}

/// A promoted-ready snapshot range.
#[derive(Debug, Clone)]
pub(crate) struct ReadySnapshot {
    /// First covered address
    pub start: usize,
    /// Last covered address (inclusive)
    pub end: usize,
    /// Bytes covering `start..=end` (`data[0]` is the byte at `start`)
    pub data: Vec<u8>,
    /// Which bytes the peer actually sent (bidirectional blocks only);
    /// indexed by absolute block address
    pub received_bits: Option<Vec<u8>>,
}

impl ReadySnapshot {
    /// Whether block byte `i` was received in this snapshot. Always true
    /// for ordinary (non-bidirectional) transfers.
    pub fn byte_received(&self, i: usize) -> bool {
        match &self.received_bits {
            Some(bits) => bits[i >> 3] & (1 << (i & 7)) != 0,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(bits: u8) -> FrameFlags {
        FrameFlags::from_byte(bits)
    }

    #[test]
    fn nothing_promotes_before_sync_complete() {
        let mut tbuf = TargetBuffer::new(8, 21, 32, false);
        tbuf.apply_frame(0, &[1, 2, 3], flags(0)).unwrap();
        assert!(!tbuf.ready());
        assert!(tbuf.take_ready().is_none());

        tbuf.apply_frame(3, &[4, 5], flags(FrameFlags::SYNC_COMPLETE)).unwrap();
        let snap = tbuf.take_ready().unwrap();
        assert_eq!((snap.start, snap.end), (0, 4));
        assert_eq!(&snap.data[0..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn delta_frames_xor_against_the_shadow() {
        let mut tbuf = TargetBuffer::new(8, 21, 32, false);
        tbuf.apply_frame(0, &[0xF0; 4], flags(FrameFlags::SYNC_COMPLETE)).unwrap();
        tbuf.take_ready();

        tbuf.apply_frame(
            0,
            &[0x0F; 4],
            flags(FrameFlags::DELTA_ENCODED | FrameFlags::SYNC_COMPLETE),
        )
        .unwrap();
        let snap = tbuf.take_ready().unwrap();
        assert_eq!(&snap.data[0..4], &[0xFF; 4]);
    }

    #[test]
    fn unconsumed_snapshots_merge() {
        let mut tbuf = TargetBuffer::new(8, 21, 32, false);
        // An earlier promoted snapshot fills what becomes the gap between
        // the two merged ranges.
        tbuf.apply_frame(2, &[9, 9, 9, 9], flags(FrameFlags::SYNC_COMPLETE)).unwrap();
        assert!(tbuf.take_ready().is_some());

        tbuf.apply_frame(0, &[1, 1], flags(FrameFlags::SYNC_COMPLETE)).unwrap();
        tbuf.apply_frame(8, &[2, 2], flags(FrameFlags::SYNC_COMPLETE)).unwrap();

        let snap = tbuf.take_ready().unwrap();
        assert_eq!((snap.start, snap.end), (0, 9));
        assert_eq!(&snap.data[0..2], &[1, 1]);
        assert_eq!(&snap.data[8..10], &[2, 2]);
        // Gap bytes carry the shadow content, never stale ready-stage
        // bytes: 2..=5 from the earlier snapshot, 6..=7 untouched zeros.
        assert_eq!(&snap.data[2..6], &[9, 9, 9, 9]);
        assert_eq!(&snap.data[6..8], &[0, 0]);
    }

    #[test]
    fn out_of_range_frames_are_rejected() {
        let mut tbuf = TargetBuffer::new(8, 21, 8, false);
        assert!(tbuf.apply_frame(8, &[1], flags(0)).is_err());
        assert!(tbuf.apply_frame(4, &[1; 8], flags(0)).is_err());
    }

    #[test]
    fn bidirectional_marks_received_bytes_only() {
        let mut tbuf = TargetBuffer::new(8, 21, 16, true);
        tbuf.apply_frame(4, &[9, 9], flags(FrameFlags::SYNC_COMPLETE)).unwrap();

        let snap = tbuf.take_ready().unwrap();
        assert!(snap.byte_received(4));
        assert!(snap.byte_received(5));
        assert!(!snap.byte_received(3));
        assert!(!snap.byte_received(6));

        // Marks are consumed with the snapshot.
        tbuf.apply_frame(0, &[1], flags(FrameFlags::SYNC_COMPLETE)).unwrap();
        let snap = tbuf.take_ready().unwrap();
        assert!(snap.byte_received(0));
        assert!(!snap.byte_received(4));
    }
}
