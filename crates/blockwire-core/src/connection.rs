//! Connection: one framed byte stream between two fabric nodes.
//!
//! ```text
//! Idle -> Opening -> HandshakingPre -> Authenticating -> Established
//!   ^                                                        |
//!   +--------------------- Failed <-------------------------+
//! ```
//!
//! This module owns the mechanics: frame staging, flow-control counters,
//! the round-robin source cursor, keepalive bookkeeping. The root drives
//! the per-tick order of work and everything that needs the block
//! registry (dispatch, mbinfo handling, promotion) because those paths
//! touch several objects at once.
//!
//! Flow control is credit-based, all arithmetic modulo 2^16: the receiver
//! acknowledges its received-byte counter, and the sender may only emit a
//! frame while `frame_bytes <= max_in_air - (bytes_sent - peer_processed)`.
//! Acknowledge frames draw on a small reserve above `max_in_air` so they
//! still flow when data credit is exhausted.

use std::{collections::VecDeque, time::Duration};

use blockwire_proto::{
    compress::{pack_range, PackOutcome},
    frame::{header_len, next_frame_nr},
    handshake::{ClientHandshake, ServerHandshake},
    Frame, FrameFlags, FrameReader, SystemFrame, Transport,
};

use crate::{
    error::{FabricError, Progress},
    link::{Connector, Link},
    mblk::MblkId,
    sbuf::SourceBuffer,
    tbuf::TargetBuffer,
};

/// Process-unique connection identifier.
pub type ConnId = u32;

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We called connect()
    Initiator,
    /// An end point accepted the stream
    Accepted,
}

/// Connection life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not running; initiators wait here between reconnect attempts
    Idle,
    /// Stream attached, first tick pending
    Opening,
    /// Pre-protocol handshake in progress
    HandshakingPre,
    /// Authentication frames being exchanged
    Authenticating,
    /// Full protocol running
    Established,
    /// Dead; cleaned up by the root
    Failed,
}

/// Per-transport timing and flow-control constants.
#[derive(Debug, Clone)]
pub struct TransportTuning {
    /// Maximum frame size (header + payload) in bytes
    pub frame_sz: usize,
    /// Send credit window
    pub max_in_air: u16,
    /// Credit window for acknowledge frames; the slack above
    /// `max_in_air` is reserved for them
    pub max_ack_in_air: u16,
    /// Receiver acknowledges once this many bytes are unacknowledged
    pub unacknowledged_limit: u16,
    /// Idle interval after which a keepalive acknowledge is sent
    pub keepalive: Duration,
    /// Inactivity interval after which the connection is failed
    pub timeout: Duration,
    /// Delay before an initiator retries after a failure
    pub reopen_delay: Duration,
}

impl TransportTuning {
    /// Defaults for a transport.
    #[must_use]
    pub fn for_transport(transport: Transport) -> Self {
        if transport.is_serial() {
            Self {
                frame_sz: 96,
                max_in_air: 288,
                max_ack_in_air: 288 + 64,
                unacknowledged_limit: 96,
                keepalive: Duration::from_secs(3),
                timeout: Duration::from_secs(8),
                reopen_delay: Duration::from_secs(2),
            }
        } else {
            Self {
                frame_sz: 1024,
                max_in_air: 3072,
                max_ack_in_air: 3072 + 64,
                unacknowledged_limit: 1024,
                keepalive: Duration::from_secs(20),
                timeout: Duration::from_secs(50),
                reopen_delay: Duration::from_secs(2),
            }
        }
    }
}

/// Parameters for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Stream flavor; controls framing and tuning defaults
    pub transport: Transport,
    /// True when this node is the device side (connecting toward its
    /// controller); governs mbinfo propagation
    pub connect_up: bool,
    /// Reconnect automatically after failures (initiators only)
    pub reopen: bool,
    /// Cloud network name for the pre-protocol handshake
    pub cloud_network: Option<String>,
    /// Ask the acceptor for its trust certificate during the handshake
    pub request_trust_cert: bool,
    /// Timing and credit constants
    pub tuning: TransportTuning,
}

impl ConnectionConfig {
    /// Socket connection with default tuning.
    #[must_use]
    pub fn socket() -> Self {
        Self {
            transport: Transport::Tcp,
            connect_up: true,
            reopen: false,
            cloud_network: None,
            request_trust_cert: false,
            tuning: TransportTuning::for_transport(Transport::Tcp),
        }
    }

    /// Serial connection with default tuning.
    #[must_use]
    pub fn serial() -> Self {
        Self {
            transport: Transport::Serial,
            connect_up: true,
            reopen: false,
            cloud_network: None,
            request_trust_cert: false,
            tuning: TransportTuning::for_transport(Transport::Serial),
        }
    }
}

/// Peer identity learned from its authentication frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// User / device-id name
    pub user_name: String,
    /// Device number, after automatic assignment if requested
    pub device_nr: u32,
    /// IO network the peer belongs to
    pub network_name: String,
    /// Hardware unique id, if presented
    pub unique_id: Option<[u8; 16]>,
    /// Whether the peer connects upward (it is the device side)
    pub connect_up: bool,
}

/// Pre-protocol handshake driver, one side or the other.
pub(crate) enum PreHandshake {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

/// Result of a completed pre-protocol handshake.
pub(crate) struct HandshakeOutcome {
    /// Trust certificate received by the client side, if any
    pub trust_certificate: Option<Vec<u8>>,
    /// The initiator's hello, on the acceptor side
    pub hello: Option<blockwire_proto::handshake::Hello>,
}

/// Snapshot of a connection's counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStats {
    /// Current state
    pub state: ConnState,
    /// Bytes sent but not yet acknowledged by the peer
    pub in_air: u16,
    /// Send credit window
    pub max_in_air: u16,
    /// Total bytes sent, modulo 2^16
    pub bytes_sent: u16,
    /// Total bytes received, modulo 2^16
    pub bytes_received: u16,
    /// Whether a staged frame is waiting to drain
    pub frame_out_used: bool,
}

/// One connection and everything staged on it.
pub(crate) struct Connection<I> {
    pub id: ConnId,
    pub role: ConnectionRole,
    pub cfg: ConnectionConfig,
    pub state: ConnState,
    pub link: Option<Box<dyn Link>>,
    pub connector: Option<Connector>,

    reader: FrameReader,
    out: Vec<u8>,
    out_pos: usize,
    out_frame_nr: u8,

    pub sbufs: Vec<SourceBuffer>,
    pub tbufs: Vec<TargetBuffer>,
    sbuf_cursor: usize,

    /// Blocks whose info is still to be announced to the peer
    pub mbinfo_queue: VecDeque<MblkId>,
    /// Block ids already announced on this connection
    pub announced: Vec<MblkId>,
    /// Peer-side ids the peer must be told to forget
    pub remove_queue: VecDeque<MblkId>,

    bytes_sent: u16,
    peer_processed: u16,
    bytes_received: u16,
    bytes_acked: u16,

    pub last_send: I,
    pub last_receive: I,
    pub failed_at: Option<I>,

    pub pre: Option<PreHandshake>,
    pub auth_sent: bool,
    pub auth_received: bool,
    pub peer: Option<PeerIdentity>,
}

impl<I: Copy> Connection<I> {
    pub fn new(
        id: ConnId,
        role: ConnectionRole,
        cfg: ConnectionConfig,
        link: Option<Box<dyn Link>>,
        connector: Option<Connector>,
        now: I,
    ) -> Self {
        let transport = cfg.transport;
        Self {
            id,
            role,
            cfg,
            state: if link.is_some() { ConnState::Opening } else { ConnState::Idle },
            link,
            connector,
            reader: FrameReader::new(transport),
            out: Vec::new(),
            out_pos: 0,
            out_frame_nr: 0,
            sbufs: Vec::new(),
            tbufs: Vec::new(),
            sbuf_cursor: 0,
            mbinfo_queue: VecDeque::new(),
            announced: Vec::new(),
            remove_queue: VecDeque::new(),
            bytes_sent: 0,
            peer_processed: 0,
            bytes_received: 0,
            bytes_acked: 0,
            last_send: now,
            last_receive: now,
            failed_at: None,
            pre: None,
            auth_sent: false,
            auth_received: false,
            peer: None,
        }
    }

    /// Reset protocol state for a fresh stream (reconnect).
    pub fn reset_for_reopen(&mut self, link: Box<dyn Link>, now: I) {
        self.link = Some(link);
        self.state = ConnState::Opening;
        self.reader = FrameReader::new(self.cfg.transport);
        self.out.clear();
        self.out_pos = 0;
        self.out_frame_nr = 0;
        self.sbufs.clear();
        self.tbufs.clear();
        self.sbuf_cursor = 0;
        self.mbinfo_queue.clear();
        self.announced.clear();
        self.remove_queue.clear();
        self.bytes_sent = 0;
        self.peer_processed = 0;
        self.bytes_received = 0;
        self.bytes_acked = 0;
        self.last_send = now;
        self.last_receive = now;
        self.failed_at = None;
        self.pre = None;
        self.auth_sent = false;
        self.auth_received = false;
        self.peer = None;
    }

    /// Close the stream and mark the connection failed. Buffer teardown is
    /// the root's job.
    pub fn fail(&mut self, now: I, reason: &str) {
        if self.state != ConnState::Failed {
            tracing::debug!(conn = self.id, reason, "connection failed");
        }
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.state = ConnState::Failed;
        self.failed_at = Some(now);
        self.pre = None;
    }

    /// Whether this node is the device side of the connection.
    ///
    /// Initiators know from their configuration; acceptors learn it from
    /// the peer's authentication frame (the peer connecting up makes us
    /// the controller side).
    pub fn is_up_from_here(&self) -> bool {
        match self.role {
            ConnectionRole::Initiator => self.cfg.connect_up,
            ConnectionRole::Accepted => {
                self.peer.as_ref().is_some_and(|peer| !peer.connect_up)
            }
        }
    }

    pub fn stats(&self) -> ConnStats {
        ConnStats {
            state: self.state,
            in_air: self.in_air(),
            max_in_air: self.cfg.tuning.max_in_air,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            frame_out_used: !self.out_is_empty(),
        }
    }

    // --- flow control ---------------------------------------------------

    fn in_air(&self) -> u16 {
        self.bytes_sent.wrapping_sub(self.peer_processed)
    }

    /// Bytes of data credit left.
    pub fn credit(&self) -> i32 {
        i32::from(self.cfg.tuning.max_in_air) - i32::from(self.in_air())
    }

    fn ack_credit(&self) -> i32 {
        i32::from(self.cfg.tuning.max_ack_in_air) - i32::from(self.in_air())
    }

    /// Record an acknowledge from the peer.
    pub fn peer_acknowledged(&mut self, bytes_received: u16) {
        self.peer_processed = bytes_received;
    }

    // --- staging --------------------------------------------------------

    pub fn out_is_empty(&self) -> bool {
        self.out_pos >= self.out.len()
    }

    fn stage(&mut self, frame: &Frame) -> Result<(), FabricError> {
        debug_assert!(self.out_is_empty());
        self.out.clear();
        self.out_pos = 0;
        let nr = next_frame_nr(self.out_frame_nr);
        frame.encode(self.cfg.transport, nr, &mut self.out)?;
        self.out_frame_nr = nr;
        Ok(())
    }

    /// Stage a system frame if credit allows. Returns false when the
    /// staging buffer is busy or credit is insufficient.
    pub fn stage_system_frame(
        &mut self,
        mblk_id: MblkId,
        sys: &SystemFrame,
    ) -> Result<bool, FabricError> {
        if !self.out_is_empty() {
            return Ok(false);
        }
        let mut payload = Vec::new();
        sys.encode(&mut payload)?;
        let total = header_len(self.cfg.transport, mblk_id, 0) + payload.len();
        let credit = if matches!(sys, SystemFrame::Acknowledge { .. }) {
            self.ack_credit()
        } else {
            self.credit()
        };
        if total as i32 > credit {
            tracing::trace!(conn = self.id, total, credit, "system frame held by flow control");
            return Ok(false);
        }
        let mut flags = FrameFlags::empty();
        flags.insert(FrameFlags::SYSTEM_FRAME);
        self.stage(&Frame::new(mblk_id, 0, flags, payload))?;
        Ok(true)
    }

    /// Queue an acknowledge if one is due (or `force` for keepalive).
    pub fn maybe_stage_ack(&mut self, force: bool) -> Result<bool, FabricError> {
        if !self.out_is_empty() {
            return Ok(false);
        }
        let unacked = self.bytes_received.wrapping_sub(self.bytes_acked);
        if !force && unacked < self.cfg.tuning.unacknowledged_limit {
            return Ok(false);
        }
        let ack = SystemFrame::Acknowledge { bytes_received: self.bytes_received };
        if self.stage_system_frame(0, &ack)? {
            self.bytes_acked = self.bytes_received;
            return Ok(true);
        }
        Ok(false)
    }

    /// Build one data frame from the source buffer at `idx`.
    ///
    /// `block_data` is the owning block's content (the wire reference for
    /// static blocks). Returns true if a frame was staged; false when
    /// there is nothing to send or flow control refused it, in which case
    /// no buffer state was changed.
    pub fn build_data_frame(
        &mut self,
        idx: usize,
        block_data: &[u8],
    ) -> Result<bool, FabricError> {
        if !self.out_is_empty() {
            return Ok(false);
        }
        let transport = self.cfg.transport;
        let frame_sz = self.cfg.tuning.frame_sz;
        let credit = self.credit();

        let staged = {
            let sbuf = &mut self.sbufs[idx];
            let Some((start, end)) = sbuf.pending_range() else {
                return Ok(false);
            };
            let hdr = header_len(transport, sbuf.remote_mblk_id, start as u32);
            let max_payload = frame_sz
                .saturating_sub(hdr)
                .min(transport.max_payload());
            if max_payload == 0 {
                return Ok(false);
            }

            let (image, delta) = sbuf.wire_image(block_data);
            let end = end.min(image.len().saturating_sub(1));
            let mut flags = FrameFlags::empty();
            if delta {
                flags.insert(FrameFlags::DELTA_ENCODED);
            }
            let (payload, next_addr) = match pack_range(image, start, end, max_payload) {
                PackOutcome::Encoded { data, next_addr } => {
                    flags.insert(FrameFlags::COMPRESSED);
                    (data, next_addr)
                }
                PackOutcome::Incompressible => {
                    let n = (end - start + 1).min(max_payload);
                    (image[start..start + n].to_vec(), start + n)
                }
            };

            let total = hdr + payload.len();
            if total as i32 > credit {
                tracing::trace!(
                    conn = self.id,
                    total,
                    credit,
                    "data frame canceled by flow control"
                );
                return Ok(false);
            }

            if sbuf.advance(next_addr) {
                flags.insert(FrameFlags::SYNC_COMPLETE);
            }
            Frame::new(sbuf.remote_mblk_id, start as u32, flags, payload)
        };

        self.stage(&staged)?;
        Ok(true)
    }

    /// Pick the next source buffer with work, round-robin from the cursor.
    pub fn next_ready_sbuf(&mut self) -> Option<usize> {
        if self.sbufs.is_empty() {
            return None;
        }
        let n = self.sbufs.len();
        let start = self.sbuf_cursor % n;
        for step in 0..n {
            let idx = (start + step) % n;
            if self.sbufs[idx].in_flight() {
                self.sbuf_cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Find the source buffer for a local block, if attached.
    pub fn sbuf_for_block(&mut self, mblk_id: MblkId) -> Option<&mut SourceBuffer> {
        self.sbufs.iter_mut().find(|sbuf| sbuf.mblk_id == mblk_id)
    }

    /// Find the target buffer for a local block, if attached.
    pub fn tbuf_for_block(&mut self, mblk_id: MblkId) -> Option<&mut TargetBuffer> {
        self.tbufs.iter_mut().find(|tbuf| tbuf.mblk_id == mblk_id)
    }

    // --- pre-protocol handshake ------------------------------------------

    /// Drive the pre-protocol handshake one step.
    ///
    /// Returns `Some(outcome)` once the exchange completes; bytes received
    /// beyond the handshake are handed straight to the frame reader.
    pub fn pump_handshake(&mut self, now: I) -> Result<Option<HandshakeOutcome>, FabricError> {
        if self.pre.is_none() {
            return Ok(None);
        }
        if self.link.is_none() {
            return Err(FabricError::NotConnected);
        }

        // Write whatever the handshake wants out.
        let pending: Vec<u8> = match self.pre.as_ref() {
            Some(PreHandshake::Client(hs)) => hs.pending_out().to_vec(),
            Some(PreHandshake::Server(hs)) => hs.pending_out().to_vec(),
            None => Vec::new(),
        };
        if pending.is_empty() {
            // Let the client side notice that its hello is fully written.
            if let Some(PreHandshake::Client(hs)) = self.pre.as_mut() {
                hs.consume_out(0);
            }
        } else {
            let n = {
                let Some(link) = self.link.as_mut() else {
                    return Err(FabricError::NotConnected);
                };
                link.write(&pending)?
            };
            if n > 0 {
                self.last_send = now;
                match self.pre.as_mut() {
                    Some(PreHandshake::Client(hs)) => hs.consume_out(n),
                    Some(PreHandshake::Server(hs)) => hs.consume_out(n),
                    None => {}
                }
            }
        }

        // Read and feed; anything past the handshake belongs to the frame
        // layer already.
        let mut chunk = [0u8; 512];
        let n = {
            let Some(link) = self.link.as_mut() else {
                return Err(FabricError::NotConnected);
            };
            link.read(&mut chunk)?
        };
        if n > 0 {
            self.last_receive = now;
            let used = match self.pre.as_mut() {
                Some(PreHandshake::Client(hs)) => hs.feed(&chunk[..n])?,
                Some(PreHandshake::Server(hs)) => hs.feed(&chunk[..n])?,
                None => 0,
            };
            if used < n {
                self.reader.push(&chunk[used..n]);
            }
        }

        let complete = match self.pre.as_ref() {
            Some(PreHandshake::Client(hs)) => hs.is_complete(),
            Some(PreHandshake::Server(hs)) => hs.is_complete(),
            None => false,
        };
        if !complete {
            return Ok(None);
        }

        let outcome = match self.pre.take() {
            Some(PreHandshake::Client(hs)) => HandshakeOutcome {
                trust_certificate: hs
                    .certificate()
                    .filter(|cert| !cert.is_empty())
                    .map(<[u8]>::to_vec),
                hello: None,
            },
            Some(PreHandshake::Server(hs)) => {
                HandshakeOutcome { trust_certificate: None, hello: hs.hello().cloned() }
            }
            None => HandshakeOutcome { trust_certificate: None, hello: None },
        };
        Ok(Some(outcome))
    }

    // --- stream I/O -----------------------------------------------------

    /// Read from the stream and decode complete frames.
    ///
    /// Updates the receive counters and `last_receive`.
    pub fn read_frames(&mut self, now: I, limit: usize) -> Result<Vec<Frame>, FabricError> {
        let mut chunk = vec![0u8; self.cfg.tuning.frame_sz.max(256) * 2];
        let n = {
            let Some(link) = self.link.as_mut() else {
                return Err(FabricError::NotConnected);
            };
            link.read(&mut chunk)?
        };
        if n > 0 {
            self.reader.push(&chunk[..n]);
            self.last_receive = now;
        }

        let mut frames = Vec::new();
        while frames.len() < limit {
            match self.reader.next_frame()? {
                Some((frame, consumed)) => {
                    self.bytes_received = self.bytes_received.wrapping_add(consumed as u16);
                    frames.push(frame);
                }
                None => break,
            }
        }
        Ok(frames)
    }

    /// Drain the staged frame to the stream.
    pub fn pump_out(&mut self, now: I) -> Result<Progress, FabricError> {
        if self.out_is_empty() {
            return Ok(Progress::NothingToDo);
        }
        let n = {
            let Some(link) = self.link.as_mut() else {
                return Err(FabricError::NotConnected);
            };
            link.write(&self.out[self.out_pos..])?
        };
        if n > 0 {
            self.out_pos += n;
            self.bytes_sent = self.bytes_sent.wrapping_add(n as u16);
            self.last_send = now;
        }
        if self.out_is_empty() {
            self.out.clear();
            self.out_pos = 0;
            if let Some(link) = self.link.as_mut() {
                link.flush()?;
            }
            Ok(Progress::Done)
        } else {
            Ok(Progress::Pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn conn(tuning_frames: u16) -> Connection<Instant> {
        let mut cfg = ConnectionConfig::socket();
        cfg.tuning.max_in_air = tuning_frames;
        cfg.tuning.max_ack_in_air = tuning_frames + 64;
        Connection::new(1, ConnectionRole::Initiator, cfg, None, None, Instant::now())
    }

    #[test]
    fn credit_shrinks_with_unacknowledged_bytes() {
        let mut c = conn(1000);
        assert_eq!(c.credit(), 1000);
        c.bytes_sent = c.bytes_sent.wrapping_add(300);
        assert_eq!(c.credit(), 700);
        c.peer_acknowledged(200);
        assert_eq!(c.credit(), 900);
    }

    #[test]
    fn credit_survives_counter_wrap() {
        let mut c = conn(1000);
        c.bytes_sent = 0xFFF0;
        c.peer_processed = 0xFFF0;
        assert_eq!(c.credit(), 1000);
        c.bytes_sent = c.bytes_sent.wrapping_add(0x20); // wraps past zero
        assert_eq!(c.credit(), 1000 - 0x20);
        c.peer_acknowledged(0x0010);
        assert_eq!(c.credit(), 1000);
    }

    #[test]
    fn data_frame_respects_credit() {
        let mut c = conn(8); // credit smaller than any frame
        let data = vec![1u8; 64];
        c.sbufs.push(SourceBuffer::new(8, 21, 64, false));
        c.sbufs[0].synchronize(&data);

        assert!(!c.build_data_frame(0, &data).unwrap());
        // Refused by flow control: snapshot untouched.
        assert_eq!(c.sbufs[0].pending_range(), Some((0, 63)));
        assert!(c.out_is_empty());
    }

    #[test]
    fn data_frame_builds_and_completes_snapshot() {
        let mut c = conn(3000);
        let data = vec![7u8; 64];
        c.sbufs.push(SourceBuffer::new(8, 21, 64, false));
        c.sbufs[0].synchronize(&data);

        assert!(c.build_data_frame(0, &data).unwrap());
        assert!(!c.out_is_empty());
        assert!(!c.sbufs[0].in_flight(), "whole snapshot fits one frame");
    }

    #[test]
    fn ack_threshold_and_keepalive_force() {
        let mut c = conn(3000);
        c.link = None;
        c.bytes_received = 100; // below the 1024 limit
        assert!(!c.maybe_stage_ack(false).unwrap());
        assert!(c.maybe_stage_ack(true).unwrap());
        assert!(!c.out_is_empty());
    }

    #[test]
    fn round_robin_cursor_cycles() {
        let mut c = conn(3000);
        let data = vec![1u8; 32];
        for id in 0..3u16 {
            let mut sbuf = SourceBuffer::new(8 + id, 20 + id, 32, false);
            sbuf.synchronize(&data);
            c.sbufs.push(sbuf);
        }
        let first = c.next_ready_sbuf().unwrap();
        let second = c.next_ready_sbuf().unwrap();
        let third = c.next_ready_sbuf().unwrap();
        assert_eq!(
            {
                let mut picks = [first, second, third];
                picks.sort_unstable();
                picks
            },
            [0, 1, 2]
        );
    }
}
