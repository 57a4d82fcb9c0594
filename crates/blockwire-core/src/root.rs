//! Root: the registry owning all blocks, connections and end points.
//!
//! The C ancestry of this design kept a process-wide mutex around one big
//! object graph of intrusive lists. Here the graph is id-keyed maps owned
//! by a single `Root`, and "holding the lock" is simply holding
//! `&mut Root`; multi-threaded deployments wrap the root in a `Mutex`
//! ([`SharedRoot`]) and get exactly the same serialization. Buffers store
//! ids, never pointers, so there are no cycles to manage.
//!
//! The root also drives the cooperative scheduler: [`Root::run`] gives
//! every end point and connection one non-blocking iteration. Stream I/O
//! happens inside that tick; applications on a microcontroller call it
//! from their main loop, hosts call it from a thread.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use blockwire_proto::{
    handshake::{ClientHandshake, ProcessType, ServerHandshake},
    AuthData, AuthFlags, Frame, FrameFlags, MblkInfo, SystemFrame, Transport,
};

use crate::{
    autonr::{AutoNumbers, AUTO_DEVICE_NR},
    connection::{
        ConnId, ConnStats, ConnState, Connection, ConnectionConfig, ConnectionRole,
        PreHandshake,
    },
    discovery::{
        parse_info, DynamicNetwork, DynamicSignal, MblkShortcut, INFO_BLOCK_NAME,
    },
    endpoint::{EndPoint, EndPointId, ACCEPT_THROTTLE},
    env::{Environment, SystemEnv},
    error::FabricError,
    link::{Acceptor, Connector, Link},
    mblk::{
        BlockCallback, BlockHandle, ChangeReason, MblkFlags, MblkId, MemoryBlock,
        MemoryBlockParams, Swap, MAX_MBLK_ID, MIN_MBLK_ID,
    },
    persist::{BlobId, Persistent},
    sbuf::SourceBuffer,
    signal::Signal,
    tbuf::{ReadySnapshot, TargetBuffer},
};

/// Identity and policy of one fabric node.
#[derive(Debug, Clone, Default)]
pub struct RootConfig {
    /// Device type name ("GINA"); empty for pure controllers
    pub device_name: String,
    /// Device number; [`AUTO_DEVICE_NR`] requests automatic numbering
    pub device_nr: u32,
    /// IO network name; empty or "*" adopts the peer's network
    pub network_name: String,
    /// User name sent in the authentication frame
    pub user_name: String,
    /// Password sent in the authentication frame
    pub password: String,
    /// Hardware unique id presented for stable automatic numbering
    pub unique_id: Option<[u8; 16]>,
    /// Permit passwords over non-TLS links (explicit policy knob)
    pub allow_clear_auth: bool,
    /// Materialize memory blocks from received mbinfo (controller role)
    pub dynamic_mblks: bool,
    /// Trust certificate served to handshake requests
    pub trust_certificate: Option<Vec<u8>>,
}

/// Lifecycle events queued for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootEvent {
    /// A memory block was created (by the application or by discovery)
    NewMemoryBlock {
        /// Handle of the new block
        handle: BlockHandle,
        /// Network it belongs to
        network_name: String,
        /// Device name
        device_name: String,
        /// Device number
        device_nr: u32,
        /// Block name
        mblk_name: String,
    },
    /// A source buffer was attached: this block now feeds a connection
    MblkConnectedAsSource {
        /// Block involved
        handle: BlockHandle,
        /// Connection it now feeds
        connection: ConnId,
    },
    /// A target buffer was attached: this block now mirrors a connection
    MblkConnectedAsTarget {
        /// Block involved
        handle: BlockHandle,
        /// Connection it now mirrors
        connection: ConnId,
    },
    /// A memory block was deleted
    MemoryBlockDeleted {
        /// Handle the block had (no longer valid)
        handle: BlockHandle,
        /// Network it belonged to
        network_name: String,
        /// Device name
        device_name: String,
        /// Device number
        device_nr: u32,
        /// Block name
        mblk_name: String,
    },
    /// First contact with an IO network
    NewNetwork {
        /// Network name
        network_name: String,
    },
    /// Last device of a network went away
    NetworkDisconnected {
        /// Network name
        network_name: String,
    },
    /// First block of a device appeared
    NewDevice {
        /// Network name
        network_name: String,
        /// Device name
        device_name: String,
        /// Device number
        device_nr: u32,
    },
    /// All connections serving a device went away
    DeviceDisconnected {
        /// Network name
        network_name: String,
        /// Device name
        device_name: String,
        /// Device number
        device_nr: u32,
    },
}

/// Name/size/flag snapshot of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfoView {
    /// Block name
    pub mblk_name: String,
    /// Device name
    pub device_name: String,
    /// Device number
    pub device_nr: u32,
    /// Network name
    pub network_name: String,
    /// Size in bytes
    pub nbytes: usize,
    /// Flags
    pub flags: MblkFlags,
}

/// The communication root.
pub struct Root<E: Environment = SystemEnv> {
    env: E,
    cfg: RootConfig,
    blocks: HashMap<MblkId, MemoryBlock>,
    connections: HashMap<ConnId, Connection<E::Instant>>,
    endpoints: HashMap<EndPointId, EndPoint<E::Instant>>,
    next_mblk_id: MblkId,
    next_conn_id: ConnId,
    next_ep_id: EndPointId,
    events: VecDeque<RootEvent>,
    dnetworks: HashMap<String, DynamicNetwork>,
    autonr: AutoNumbers,
    persistent: Option<Box<dyn Persistent>>,
}

impl Root<SystemEnv> {
    /// New root on the system clock and RNG.
    #[must_use]
    pub fn new(cfg: RootConfig) -> Self {
        Self::with_env(cfg, SystemEnv)
    }
}

impl<E: Environment> Root<E> {
    /// New root on an explicit environment (simulation harnesses).
    #[must_use]
    pub fn with_env(cfg: RootConfig, env: E) -> Self {
        Self {
            env,
            cfg,
            blocks: HashMap::new(),
            connections: HashMap::new(),
            endpoints: HashMap::new(),
            next_mblk_id: MIN_MBLK_ID,
            next_conn_id: 1,
            next_ep_id: 1,
            events: VecDeque::new(),
            dnetworks: HashMap::new(),
            autonr: AutoNumbers::default(),
            persistent: None,
        }
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &RootConfig {
        &self.cfg
    }

    /// Attach a persistent-storage provider.
    pub fn set_persistent(&mut self, persistent: Box<dyn Persistent>) {
        self.persistent = Some(persistent);
    }

    /// Next queued lifecycle event, if any.
    pub fn poll_event(&mut self) -> Option<RootEvent> {
        self.events.pop_front()
    }

    // --- memory block API -----------------------------------------------

    /// Create a memory block.
    ///
    /// Empty identity fields inherit the root's identity.
    ///
    /// # Errors
    ///
    /// - [`FabricError::NotSupported`] for invalid names/flags
    /// - [`FabricError::MemoryAllocation`] when the id space is exhausted
    pub fn create_memory_block(
        &mut self,
        prm: &MemoryBlockParams<'_>,
    ) -> Result<BlockHandle, FabricError> {
        let handle = self.create_block_internal(prm)?;
        let id = handle.id;
        for conn in self.connections.values_mut() {
            if conn.state == ConnState::Established
                && conn.is_up_from_here()
                && !conn.announced.contains(&id)
            {
                conn.mbinfo_queue.push_back(id);
            }
        }
        Ok(handle)
    }

    fn create_block_internal(
        &mut self,
        prm: &MemoryBlockParams<'_>,
    ) -> Result<BlockHandle, FabricError> {
        let id = self.alloc_mblk_id()?;
        let device_name = if prm.device_name.is_empty() {
            self.cfg.device_name.clone()
        } else {
            prm.device_name.to_string()
        };
        let device_nr = if prm.device_nr == 0 { self.cfg.device_nr } else { prm.device_nr };
        let network_name = if prm.network_name.is_empty() {
            self.cfg.network_name.clone()
        } else {
            prm.network_name.to_string()
        };
        let block = MemoryBlock::new(
            id,
            &MemoryBlockParams {
                mblk_name: prm.mblk_name,
                device_name: &device_name,
                device_nr,
                network_name: &network_name,
                nbytes: prm.nbytes,
                flags: prm.flags,
                content: prm.content,
            },
        )?;
        self.events.push_back(RootEvent::NewMemoryBlock {
            handle: BlockHandle { id },
            network_name: block.network_name.clone(),
            device_name: block.device_name.clone(),
            device_nr: block.device_nr,
            mblk_name: block.mblk_name.clone(),
        });
        tracing::debug!(
            id,
            name = %block.mblk_name,
            nbytes = block.nbytes(),
            "memory block created"
        );
        self.blocks.insert(id, block);
        Ok(BlockHandle { id })
    }

    fn alloc_mblk_id(&mut self) -> Result<MblkId, FabricError> {
        if self.next_mblk_id <= MAX_MBLK_ID {
            let id = self.next_mblk_id;
            self.next_mblk_id += 1;
            return Ok(id);
        }
        // Counter exhausted; random draw with duplicate scan.
        for _ in 0..64 {
            let id = self.env.random_range(u32::from(MIN_MBLK_ID), u32::from(MAX_MBLK_ID)) as MblkId;
            if !self.blocks.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(FabricError::MemoryAllocation)
    }

    /// Delete a memory block, detaching its buffers and telling peers that
    /// still mirror it to forget their copies.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn release_memory_block(&mut self, handle: BlockHandle) -> Result<(), FabricError> {
        let Some(block) = self.blocks.remove(&handle.id) else {
            return Err(FabricError::Failed);
        };
        self.forget_block(block);
        Ok(())
    }

    fn forget_block(&mut self, block: MemoryBlock) {
        for &cid in block.sbuf_conns.iter().chain(block.tbuf_conns.iter()) {
            let Some(conn) = self.connections.get_mut(&cid) else {
                continue;
            };
            let up = conn.is_up_from_here();
            let mut remote = None;
            if let Some(pos) = conn.sbufs.iter().position(|s| s.mblk_id == block.id) {
                remote = Some(conn.sbufs.remove(pos).remote_mblk_id);
            }
            if let Some(pos) = conn.tbufs.iter().position(|t| t.mblk_id == block.id) {
                remote = Some(conn.tbufs.remove(pos).remote_mblk_id);
            }
            conn.mbinfo_queue.retain(|&id| id != block.id);
            if up {
                if let Some(remote) = remote {
                    if !conn.remove_queue.contains(&remote) {
                        conn.remove_queue.push_back(remote);
                    }
                }
            }
        }
        if let Some(dnet) = self.dnetworks.get_mut(&block.network_name) {
            dnet.mblk_deleted(block.id);
        }
        self.events.push_back(RootEvent::MemoryBlockDeleted {
            handle: BlockHandle { id: block.id },
            network_name: block.network_name.clone(),
            device_name: block.device_name.clone(),
            device_nr: block.device_nr,
            mblk_name: block.mblk_name.clone(),
        });
        tracing::debug!(id = block.id, name = %block.mblk_name, "memory block deleted");
    }

    /// Write bytes into a block (no endian handling).
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn write(
        &mut self,
        handle: BlockHandle,
        addr: usize,
        data: &[u8],
    ) -> Result<(), FabricError> {
        self.write_swapped(handle, addr, data, Swap::None)
    }

    /// Write bytes with endian handling for 2/4/8-byte groups.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn write_swapped(
        &mut self,
        handle: BlockHandle,
        addr: usize,
        data: &[u8],
        swap: Swap,
    ) -> Result<(), FabricError> {
        let Some(block) = self.blocks.get_mut(&handle.id) else {
            return Err(FabricError::Failed);
        };
        if block.is_static() {
            return Err(FabricError::NotSupported);
        }
        let Some((start, end)) = block.write_bytes(addr, data, swap) else {
            return Ok(());
        };
        block.invoke_callbacks(start, end, ChangeReason::LocalWrite);
        Self::invalidate_attached(block, &mut self.connections, start, end);
        Ok(())
    }

    /// Write a string into a fixed-size field.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn write_str(
        &mut self,
        handle: BlockHandle,
        addr: usize,
        n: usize,
        s: &str,
    ) -> Result<(), FabricError> {
        let Some(block) = self.blocks.get_mut(&handle.id) else {
            return Err(FabricError::Failed);
        };
        if block.is_static() {
            return Err(FabricError::NotSupported);
        }
        let Some((start, end)) = block.write_str(addr, n, s) else {
            return Ok(());
        };
        block.invoke_callbacks(start, end, ChangeReason::LocalWrite);
        Self::invalidate_attached(block, &mut self.connections, start, end);
        Ok(())
    }

    /// Zero a range of a block.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn clear(&mut self, handle: BlockHandle, addr: usize, n: usize) -> Result<(), FabricError> {
        let Some(block) = self.blocks.get_mut(&handle.id) else {
            return Err(FabricError::Failed);
        };
        if block.is_static() {
            return Err(FabricError::NotSupported);
        }
        let Some((start, end)) = block.clear_range(addr, n) else {
            return Ok(());
        };
        block.invoke_callbacks(start, end, ChangeReason::LocalWrite);
        Self::invalidate_attached(block, &mut self.connections, start, end);
        Ok(())
    }

    fn invalidate_attached(
        block: &mut MemoryBlock,
        connections: &mut HashMap<ConnId, Connection<E::Instant>>,
        start: usize,
        end: usize,
    ) {
        let auto = block.flags.contains(MblkFlags::AUTO_SYNC);
        for &cid in &block.sbuf_conns {
            let Some(conn) = connections.get_mut(&cid) else {
                continue;
            };
            if let Some(sbuf) = conn.sbuf_for_block(block.id) {
                sbuf.invalidate(start, end);
                if auto {
                    sbuf.synchronize(&block.data);
                }
            }
        }
    }

    /// Read bytes from a block (no endian handling).
    pub fn read(&self, handle: BlockHandle, addr: usize, out: &mut [u8]) {
        self.read_swapped(handle, addr, out, Swap::None);
    }

    /// Read bytes with endian handling. Stale handles read as zeros.
    pub fn read_swapped(&self, handle: BlockHandle, addr: usize, out: &mut [u8], swap: Swap) {
        match self.blocks.get(&handle.id) {
            Some(block) => block.read_bytes(addr, out, swap),
            None => out.fill(0),
        }
    }

    /// Read a zero-terminated string from a block.
    #[must_use]
    pub fn read_str(&self, handle: BlockHandle, addr: usize, max: usize) -> String {
        self.blocks
            .get(&handle.id)
            .map(|block| block.read_str(addr, max))
            .unwrap_or_default()
    }

    /// Snapshot pending writes of a block into its source buffers.
    ///
    /// Blocks without `AUTO_SYNC` accumulate writes until this is called,
    /// so changes made in one main-loop round travel together.
    pub fn send(&mut self, handle: BlockHandle) {
        let Some(block) = self.blocks.get(&handle.id) else {
            return;
        };
        for &cid in &block.sbuf_conns {
            let Some(conn) = self.connections.get_mut(&cid) else {
                continue;
            };
            if let Some(sbuf) = conn.sbuf_for_block(block.id) {
                sbuf.synchronize(&block.data);
            }
        }
    }

    /// Promote completed snapshots of a block into its content.
    ///
    /// Blocks without `AUTO_SYNC` hold received snapshots until this is
    /// called.
    pub fn receive(&mut self, handle: BlockHandle) {
        let Some(block) = self.blocks.get(&handle.id) else {
            return;
        };
        let cids = block.tbuf_conns.clone();
        for cid in cids {
            let snap = self
                .connections
                .get_mut(&cid)
                .and_then(|conn| conn.tbuf_for_block(handle.id))
                .and_then(TargetBuffer::take_ready);
            if let Some(snap) = snap {
                self.apply_snapshot(cid, handle.id, &snap);
            }
        }
    }

    /// Register a change callback on a block.
    ///
    /// # Errors
    ///
    /// - [`FabricError::Failed`] if the handle is stale
    pub fn add_callback(
        &mut self,
        handle: BlockHandle,
        callback: BlockCallback,
    ) -> Result<(), FabricError> {
        let Some(block) = self.blocks.get_mut(&handle.id) else {
            return Err(FabricError::Failed);
        };
        block.callbacks.push(callback);
        Ok(())
    }

    /// Identity and size of a block.
    #[must_use]
    pub fn block_info(&self, handle: BlockHandle) -> Option<BlockInfoView> {
        self.blocks.get(&handle.id).map(|block| BlockInfoView {
            mblk_name: block.mblk_name.clone(),
            device_name: block.device_name.clone(),
            device_nr: block.device_nr,
            network_name: block.network_name.clone(),
            nbytes: block.nbytes(),
            flags: block.flags,
        })
    }

    /// Find a block by identity. Empty query fields match anything.
    #[must_use]
    pub fn find_block(
        &self,
        network_name: &str,
        device_name: &str,
        device_nr: u32,
        mblk_name: &str,
    ) -> Option<BlockHandle> {
        self.blocks
            .values()
            .find(|b| {
                b.mblk_name == mblk_name
                    && (device_name.is_empty() || b.device_name == device_name)
                    && (device_nr == 0 || b.device_nr == device_nr)
                    && (network_name.is_empty() || b.network_name == network_name)
            })
            .map(|b| BlockHandle { id: b.id })
    }

    // --- discovery API ----------------------------------------------------

    /// Resolve a dynamic signal to a typed view plus its mirror block.
    #[must_use]
    pub fn resolve_signal(&self, network_name: &str, signal_name: &str) -> Option<(Signal, BlockHandle)> {
        let dnet = self.dnetworks.get(network_name)?;
        let (dsig, mblk_id) = dnet.resolve(signal_name)?;
        Some((Signal::new(dsig.addr, dsig.n, dsig.kind), BlockHandle { id: mblk_id }))
    }

    /// Look up a dynamic signal descriptor.
    #[must_use]
    pub fn dynamic_signal(&self, network_name: &str, signal_name: &str) -> Option<&DynamicSignal> {
        self.dnetworks.get(network_name)?.find_signal(signal_name)
    }

    /// Names of all known dynamic networks.
    #[must_use]
    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dnetworks.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    // --- connection API ---------------------------------------------------

    /// Open a connection over an already-established stream.
    pub fn connect(&mut self, cfg: ConnectionConfig, link: Box<dyn Link>) -> ConnId {
        let id = self.alloc_conn_id();
        let now = self.env.now();
        self.connections.insert(
            id,
            Connection::new(id, ConnectionRole::Initiator, cfg, Some(link), None, now),
        );
        tracing::info!(conn = id, "connection created");
        id
    }

    /// Open a connection through a reconnecting stream factory.
    ///
    /// # Errors
    ///
    /// Whatever the connector's first attempt returns.
    pub fn connect_with(
        &mut self,
        cfg: ConnectionConfig,
        mut connector: Connector,
    ) -> Result<ConnId, FabricError> {
        let link = connector()?;
        let id = self.alloc_conn_id();
        let now = self.env.now();
        self.connections.insert(
            id,
            Connection::new(
                id,
                ConnectionRole::Initiator,
                cfg,
                Some(link),
                Some(connector),
                now,
            ),
        );
        tracing::info!(conn = id, "connection created (reconnecting)");
        Ok(id)
    }

    /// Start listening; accepted streams become acceptor-role connections
    /// configured from `conn_cfg`.
    pub fn listen(&mut self, conn_cfg: ConnectionConfig, acceptor: Box<dyn Acceptor>) -> EndPointId {
        let id = self.next_ep_id;
        self.next_ep_id += 1;
        self.endpoints.insert(id, EndPoint::new(id, acceptor, conn_cfg));
        tracing::info!(endpoint = id, "end point listening");
        id
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Close and drop a connection.
    pub fn close_connection(&mut self, id: ConnId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            let now = self.env.now();
            conn.connector = None; // no reopen on explicit close
            self.teardown_connection(&mut conn, now, "closed by application");
        }
    }

    /// Stop all end points and connections.
    pub fn shutdown(&mut self) {
        let ep_ids: Vec<EndPointId> = self.endpoints.keys().copied().collect();
        for id in ep_ids {
            self.endpoints.remove(&id);
        }
        let conn_ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in conn_ids {
            self.close_connection(id);
        }
    }

    /// Counters of one connection, for diagnostics and tests.
    #[must_use]
    pub fn connection_stats(&self, id: ConnId) -> Option<ConnStats> {
        self.connections.get(&id).map(Connection::stats)
    }

    /// Ids of all live connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // --- scheduler --------------------------------------------------------

    /// Give every end point and connection one non-blocking iteration.
    pub fn run(&mut self) {
        let now = self.env.now();
        let ep_ids: Vec<EndPointId> = self.endpoints.keys().copied().collect();
        for id in ep_ids {
            self.tick_endpoint(id, now);
        }
        let conn_ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in conn_ids {
            self.tick_connection(id, now);
        }
    }

    fn tick_endpoint(&mut self, id: EndPointId, now: E::Instant) {
        let accepted = {
            let Some(ep) = self.endpoints.get_mut(&id) else {
                return;
            };
            if ep.failed {
                return;
            }
            if let Some(last) = ep.last_attempt {
                if now - last < ACCEPT_THROTTLE {
                    return;
                }
            }
            ep.last_attempt = Some(now);
            match ep.acceptor.accept() {
                Ok(Some(link)) => Some((link, ep.conn_cfg.clone())),
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(endpoint = id, %err, "accept failed; end point parked");
                    ep.failed = true;
                    None
                }
            }
        };
        if let Some((link, cfg)) = accepted {
            let cid = self.alloc_conn_id();
            self.connections.insert(
                cid,
                Connection::new(cid, ConnectionRole::Accepted, cfg, Some(link), None, now),
            );
            tracing::info!(endpoint = id, conn = cid, "stream accepted");
        }
    }

    fn tick_connection(&mut self, id: ConnId, now: E::Instant) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(err) = self.drive_connection(&mut conn, now) {
            tracing::debug!(conn = id, %err, "connection failed");
            self.teardown_connection(&mut conn, now, "stream or protocol error");
        }
        let keep = match conn.state {
            ConnState::Failed | ConnState::Idle => {
                conn.role == ConnectionRole::Initiator
                    && conn.cfg.reopen
                    && conn.connector.is_some()
            }
            _ => true,
        };
        if keep {
            self.connections.insert(id, conn);
        }
    }

    fn drive_connection(
        &mut self,
        conn: &mut Connection<E::Instant>,
        now: E::Instant,
    ) -> Result<(), FabricError> {
        match conn.state {
            ConnState::Idle | ConnState::Failed => {
                if conn.role != ConnectionRole::Initiator
                    || !conn.cfg.reopen
                    || conn.connector.is_none()
                {
                    return Ok(());
                }
                let due = match conn.failed_at {
                    Some(failed_at) => now - failed_at >= conn.cfg.tuning.reopen_delay,
                    None => true,
                };
                if !due {
                    return Ok(());
                }
                let attempt = conn
                    .connector
                    .as_mut()
                    .map(|connector| connector())
                    .unwrap_or(Err(FabricError::NotConnected));
                match attempt {
                    Ok(link) => {
                        tracing::info!(conn = conn.id, "reconnecting");
                        conn.reset_for_reopen(link, now);
                    }
                    Err(err) => {
                        tracing::debug!(conn = conn.id, %err, "reconnect attempt failed");
                        conn.failed_at = Some(now);
                    }
                }
                Ok(())
            }
            ConnState::Opening => {
                conn.pre = Some(match conn.role {
                    ConnectionRole::Initiator => PreHandshake::Client(ClientHandshake::new(
                        ProcessType::Client,
                        conn.cfg.cloud_network.as_deref(),
                        conn.cfg.request_trust_cert,
                    )?),
                    ConnectionRole::Accepted => PreHandshake::Server(ServerHandshake::new(
                        self.cfg.trust_certificate.clone().unwrap_or_default(),
                    )),
                });
                conn.state = ConnState::HandshakingPre;
                Ok(())
            }
            ConnState::HandshakingPre => {
                if let Some(outcome) = conn.pump_handshake(now)? {
                    if let Some(hello) = &outcome.hello {
                        tracing::debug!(conn = conn.id, ?hello, "handshake hello received");
                    }
                    if let Some(cert) = outcome.trust_certificate {
                        if let Some(store) = self.persistent.as_deref_mut() {
                            if let Err(err) = store.save(BlobId::TRUST_CERT, &cert, true) {
                                tracing::warn!(%err, "saving trust certificate failed");
                            }
                        }
                    }
                    conn.state = ConnState::Authenticating;
                    self.stage_auth(conn)?;
                }
                self.check_timeout(conn, now)
            }
            ConnState::Authenticating | ConnState::Established => self.protocol_tick(conn, now),
        }
    }

    fn check_timeout(
        &self,
        conn: &Connection<E::Instant>,
        now: E::Instant,
    ) -> Result<(), FabricError> {
        if now - conn.last_receive > conn.cfg.tuning.timeout {
            tracing::debug!(conn = conn.id, "inactivity timeout");
            return Err(FabricError::ConnectionReset);
        }
        Ok(())
    }

    fn stage_auth(&mut self, conn: &mut Connection<E::Instant>) -> Result<(), FabricError> {
        if conn.auth_sent || !conn.out_is_empty() {
            return Ok(());
        }
        let mut flags = AuthFlags::empty();
        if conn.cfg.connect_up {
            flags.insert(AuthFlags::CONNECT_UP);
        }
        if conn.cfg.request_trust_cert {
            flags.insert(AuthFlags::CERTIFICATE_REQUEST);
        }
        let password = if self.cfg.password.is_empty()
            || conn.cfg.transport == Transport::Tls
            || self.cfg.allow_clear_auth
        {
            self.cfg.password.clone()
        } else {
            tracing::warn!(conn = conn.id, "password withheld on clear-text link");
            String::new()
        };
        let auth = AuthData {
            flags,
            user_name: self.cfg.user_name.clone(),
            device_nr: self.cfg.device_nr,
            unique_id: self.cfg.unique_id,
            network_name: self.cfg.network_name.clone(),
            password,
        };
        if conn.stage_system_frame(0, &SystemFrame::Authentication(auth))? {
            conn.auth_sent = true;
        }
        Ok(())
    }

    fn protocol_tick(
        &mut self,
        conn: &mut Connection<E::Instant>,
        now: E::Instant,
    ) -> Result<(), FabricError> {
        if conn.state == ConnState::Authenticating && !conn.auth_sent {
            self.stage_auth(conn)?;
        }

        let frames = conn.read_frames(now, 64)?;
        for frame in &frames {
            self.dispatch_frame(conn, frame)?;
        }

        for _ in 0..8 {
            if conn.out_is_empty() {
                let staged = self.fill_frame(conn)?;
                if !staged {
                    break;
                }
            }
            if conn.pump_out(now)?.is_pending() {
                break;
            }
        }

        if conn.state == ConnState::Established
            && now - conn.last_send >= conn.cfg.tuning.keepalive
            && conn.maybe_stage_ack(true)?
        {
            conn.pump_out(now)?;
        }

        self.check_timeout(conn, now)
    }

    /// Pick the next frame to stage: acknowledge, then mbinfo, then block
    /// data round-robin, then remove requests.
    fn fill_frame(&mut self, conn: &mut Connection<E::Instant>) -> Result<bool, FabricError> {
        if conn.state != ConnState::Established {
            return Ok(false);
        }

        if conn.maybe_stage_ack(false)? {
            return Ok(true);
        }

        while let Some(&block_id) = conn.mbinfo_queue.front() {
            let Some(block) = self.blocks.get(&block_id) else {
                conn.mbinfo_queue.pop_front();
                continue;
            };
            let info = SystemFrame::MblkInfo(MblkInfo {
                device_nr: block.device_nr.min(u32::from(u16::MAX)),
                nbytes: (block.nbytes() as u32).min(u32::from(u16::MAX)),
                flags: block.flags.bits(),
                device_name: block.device_name.clone(),
                mblk_name: block.mblk_name.clone(),
            });
            if conn.stage_system_frame(block_id, &info)? {
                conn.mbinfo_queue.pop_front();
                conn.announced.push(block_id);
                return Ok(true);
            }
            // Held by flow control; retry next tick.
            return Ok(false);
        }

        // Re-snapshot drained auto-sync buffers that accumulated changes
        // while a previous snapshot was in flight.
        for idx in 0..conn.sbufs.len() {
            let (block_id, wants) = {
                let sbuf = &conn.sbufs[idx];
                (sbuf.mblk_id, !sbuf.in_flight() && sbuf.has_pending_changes())
            };
            if !wants {
                continue;
            }
            if let Some(block) = self.blocks.get(&block_id) {
                if block.flags.contains(MblkFlags::AUTO_SYNC) || block.is_static() {
                    conn.sbufs[idx].synchronize(&block.data);
                }
            }
        }

        if let Some(idx) = conn.next_ready_sbuf() {
            let block_id = conn.sbufs[idx].mblk_id;
            if let Some(block) = self.blocks.get(&block_id) {
                if conn.build_data_frame(idx, &block.data)? {
                    return Ok(true);
                }
            }
        }

        if !conn.remove_queue.is_empty() {
            let ids: Vec<MblkId> = conn.remove_queue.iter().copied().take(32).collect();
            let req = SystemFrame::RemoveMblkRequest { remote_ids: ids.clone() };
            if conn.stage_system_frame(0, &req)? {
                for _ in 0..ids.len() {
                    conn.remove_queue.pop_front();
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn dispatch_frame(
        &mut self,
        conn: &mut Connection<E::Instant>,
        frame: &Frame,
    ) -> Result<(), FabricError> {
        if frame.header.flags.contains(FrameFlags::SYSTEM_FRAME) {
            match SystemFrame::decode(&frame.payload)? {
                SystemFrame::Acknowledge { bytes_received } => {
                    conn.peer_acknowledged(bytes_received);
                }
                SystemFrame::Authentication(auth) => self.handle_auth(conn, &auth)?,
                SystemFrame::MblkInfo(info) => {
                    if conn.state == ConnState::Established {
                        self.handle_mbinfo(conn, &info, frame.header.mblk_id)?;
                    }
                }
                SystemFrame::RemoveMblkRequest { remote_ids } => {
                    if conn.state == ConnState::Established {
                        self.handle_remove_request(&remote_ids);
                    }
                }
            }
            return Ok(());
        }

        if conn.state != ConnState::Established {
            tracing::trace!(conn = conn.id, "data frame before establishment ignored");
            return Ok(());
        }

        let block_id = frame.header.mblk_id;
        let applied = match conn.tbuf_for_block(block_id) {
            Some(tbuf) => {
                tbuf.apply_frame(
                    frame.header.addr as usize,
                    &frame.payload,
                    frame.header.flags,
                )?;
                tbuf.ready()
            }
            None => {
                tracing::trace!(conn = conn.id, block_id, "data frame for unattached block");
                false
            }
        };
        if applied {
            let auto = self
                .blocks
                .get(&block_id)
                .is_some_and(|b| b.flags.contains(MblkFlags::AUTO_SYNC));
            if auto {
                self.promote_on_connection(conn, block_id);
            }
        }
        Ok(())
    }

    fn promote_on_connection(&mut self, conn: &mut Connection<E::Instant>, block_id: MblkId) {
        let snap = conn.tbuf_for_block(block_id).and_then(TargetBuffer::take_ready);
        if let Some(snap) = snap {
            self.apply_snapshot(conn.id, block_id, &snap);
        }
    }

    fn apply_snapshot(&mut self, from_conn: ConnId, block_id: MblkId, snap: &ReadySnapshot) {
        let Some(block) = self.blocks.get_mut(&block_id) else {
            return;
        };
        let len = block.nbytes();
        if snap.start >= len {
            return;
        }
        let end = snap.end.min(len - 1);
        if snap.received_bits.is_some() {
            for i in snap.start..=end {
                if snap.byte_received(i) {
                    block.data[i] = snap.data[i - snap.start];
                }
            }
        } else {
            block.data[snap.start..=end]
                .copy_from_slice(&snap.data[..end - snap.start + 1]);
        }
        block.invoke_callbacks(snap.start, end, ChangeReason::Received);

        // Echo to source buffers on other connections (middle-tier fanout).
        let auto = block.flags.contains(MblkFlags::AUTO_SYNC);
        let scids = block.sbuf_conns.clone();
        for scid in scids {
            if scid == from_conn {
                continue;
            }
            let Some(other) = self.connections.get_mut(&scid) else {
                continue;
            };
            if let Some(sbuf) = other.sbuf_for_block(block_id) {
                if snap.received_bits.is_some() {
                    for i in snap.start..=end {
                        if snap.byte_received(i) {
                            sbuf.invalidate(i, i);
                        }
                    }
                } else {
                    sbuf.invalidate(snap.start, end);
                }
                if auto {
                    sbuf.synchronize(&block.data);
                }
            }
        }

        // A freshly synchronized info block describes the device's schema.
        if block.mblk_name == INFO_BLOCK_NAME {
            if let Some(dnet) = self.dnetworks.get_mut(&block.network_name) {
                match parse_info(&block.data) {
                    Ok(doc) => {
                        dnet.absorb_info(&block.device_name, block.device_nr, &doc);
                        tracing::debug!(
                            network = %block.network_name,
                            device = %block.device_name,
                            "device schema absorbed"
                        );
                    }
                    Err(_) => {
                        tracing::debug!(network = %block.network_name, "info block unparsable");
                    }
                }
            }
        }
    }

    fn handle_auth(
        &mut self,
        conn: &mut Connection<E::Instant>,
        auth: &AuthData,
    ) -> Result<(), FabricError> {
        if conn.state != ConnState::Authenticating {
            return Ok(());
        }

        if !auth.password.is_empty()
            && conn.cfg.transport != Transport::Tls
            && !self.cfg.allow_clear_auth
        {
            tracing::warn!(conn = conn.id, "password over clear-text link refused");
            return Err(FabricError::ServerCertRejected);
        }

        let wildcard = |s: &str| s.is_empty() || s == "*";
        let peer_net = auth.network_name.clone();
        if wildcard(&self.cfg.network_name) {
            if !wildcard(&peer_net) {
                // Single-device mode: adopt the peer's network.
                tracing::info!(network = %peer_net, "adopted peer network name");
                self.cfg.network_name = peer_net.clone();
            }
        } else if !wildcard(&peer_net) && peer_net != self.cfg.network_name {
            tracing::warn!(
                conn = conn.id,
                ours = %self.cfg.network_name,
                theirs = %peer_net,
                "network name mismatch"
            );
            return Err(FabricError::ConnectionRefused);
        }

        let peer_connect_up = auth.flags.contains(AuthFlags::CONNECT_UP);
        let mut device_nr = auth.device_nr;
        if device_nr == AUTO_DEVICE_NR && peer_connect_up {
            let connections = &self.connections;
            device_nr = self.autonr.assign(
                auth.unique_id,
                self.persistent.as_deref_mut(),
                &self.env,
                |nr| {
                    connections
                        .values()
                        .any(|c| c.peer.as_ref().is_some_and(|p| p.device_nr == nr))
                },
            );
            tracing::info!(conn = conn.id, device_nr, "automatic device number assigned");
        }

        conn.peer = Some(crate::connection::PeerIdentity {
            user_name: auth.user_name.clone(),
            device_nr,
            network_name: if wildcard(&peer_net) {
                self.cfg.network_name.clone()
            } else {
                peer_net
            },
            unique_id: auth.unique_id,
            connect_up: peer_connect_up,
        });
        conn.auth_received = true;
        self.maybe_establish(conn);
        Ok(())
    }

    fn maybe_establish(&mut self, conn: &mut Connection<E::Instant>) {
        if conn.state != ConnState::Authenticating || !conn.auth_sent || !conn.auth_received {
            return;
        }
        conn.state = ConnState::Established;
        if let Some(peer) = &conn.peer {
            tracing::info!(
                conn = conn.id,
                user = %peer.user_name,
                device_nr = peer.device_nr,
                network = %peer.network_name,
                "connection established"
            );
        }
        if conn.is_up_from_here() {
            let mut ids: Vec<MblkId> = self.blocks.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                conn.mbinfo_queue.push_back(id);
            }
        }
    }

    fn handle_mbinfo(
        &mut self,
        conn: &mut Connection<E::Instant>,
        info: &MblkInfo,
        sender_id: MblkId,
    ) -> Result<(), FabricError> {
        let Some(peer) = conn.peer.clone() else {
            return Ok(());
        };
        let peer_flags = MblkFlags::from_bits(info.flags);
        let network = if peer.network_name.is_empty() {
            self.cfg.network_name.clone()
        } else {
            peer.network_name.clone()
        };
        let effective_nr = if info.device_nr == 0 || info.device_nr == AUTO_DEVICE_NR {
            peer.device_nr
        } else {
            info.device_nr
        };

        let found = self
            .blocks
            .values()
            .find(|b| {
                b.mblk_name == info.mblk_name
                    && b.device_name == info.device_name
                    && (b.device_nr == effective_nr
                        || b.device_nr == AUTO_DEVICE_NR
                        || effective_nr == 0)
                    && (b.network_name.is_empty()
                        || network.is_empty()
                        || b.network_name == network)
            })
            .map(|b| b.id);

        let block_id = match found {
            Some(id) => {
                if let Some(block) = self.blocks.get_mut(&id) {
                    if block.device_nr == AUTO_DEVICE_NR
                        && effective_nr != AUTO_DEVICE_NR
                        && effective_nr != 0
                    {
                        block.device_nr = effective_nr;
                        if self.cfg.device_nr == AUTO_DEVICE_NR {
                            self.cfg.device_nr = effective_nr;
                            tracing::info!(
                                device_nr = effective_nr,
                                "adopted assigned device number"
                            );
                        }
                    }
                    if info.nbytes as usize > block.nbytes() {
                        // Without ALLOW_RESIZE transfers clip to our size.
                        let _ = block.resize_to(info.nbytes as usize);
                    }
                }
                id
            }
            None if self.cfg.dynamic_mblks => {
                let mut bits =
                    MblkFlags::DYNAMIC | MblkFlags::AUTO_SYNC | MblkFlags::ALLOW_RESIZE;
                if peer_flags.is_up() {
                    bits |= MblkFlags::DOWN;
                }
                if peer_flags.is_down() {
                    bits |= MblkFlags::UP;
                }
                if peer_flags.contains(MblkFlags::BIDIRECTIONAL) {
                    bits |= MblkFlags::BIDIRECTIONAL;
                }
                let handle = self.create_block_internal(&MemoryBlockParams {
                    mblk_name: &info.mblk_name,
                    device_name: &info.device_name,
                    device_nr: effective_nr,
                    network_name: &network,
                    nbytes: info.nbytes as usize,
                    flags: MblkFlags::from_bits(bits),
                    content: None,
                })?;
                handle.id
            }
            None => {
                tracing::trace!(
                    conn = conn.id,
                    mblk = %info.mblk_name,
                    "mbinfo for unknown block ignored"
                );
                return Ok(());
            }
        };

        // Track the device on the controller side of the connection.
        if peer.connect_up && !network.is_empty() {
            let is_new_network = !self.dnetworks.contains_key(&network);
            let dnet = self.dnetworks.entry(network.clone()).or_default();
            let dev_key = (info.device_name.clone(), effective_nr);
            let is_new_device =
                !info.device_name.is_empty() && !dnet.devices.contains_key(&dev_key);
            if !info.device_name.is_empty() {
                dnet.devices.entry(dev_key).or_default().insert(conn.id);
            }
            dnet.add_shortcut(MblkShortcut {
                mblk_id: block_id,
                device_name: info.device_name.clone(),
                device_nr: effective_nr,
                mblk_name: info.mblk_name.clone(),
            });
            if is_new_network {
                self.events.push_back(RootEvent::NewNetwork { network_name: network.clone() });
            }
            if is_new_device {
                self.events.push_back(RootEvent::NewDevice {
                    network_name: network.clone(),
                    device_name: info.device_name.clone(),
                    device_nr: effective_nr,
                });
            }
        }

        let Some(block) = self.blocks.get_mut(&block_id) else {
            return Ok(());
        };
        let ours = block.flags;
        let both_bidir = ours.contains(MblkFlags::BIDIRECTIONAL)
            && peer_flags.contains(MblkFlags::BIDIRECTIONAL);
        let want_tbuf = (peer_flags.is_up() && ours.is_down()) || both_bidir;
        let want_sbuf = (peer_flags.is_down() && ours.is_up()) || both_bidir;

        if want_tbuf && conn.tbuf_for_block(block_id).is_none() && !block.is_static() {
            let nbytes = block.nbytes().max(info.nbytes as usize);
            conn.tbufs.push(TargetBuffer::new(block_id, sender_id, nbytes, both_bidir));
            block.tbuf_conns.push(conn.id);
            self.events.push_back(RootEvent::MblkConnectedAsTarget {
                handle: BlockHandle { id: block_id },
                connection: conn.id,
            });
        }
        if want_sbuf && conn.sbuf_for_block(block_id).is_none() {
            let mut sbuf =
                SourceBuffer::new(block_id, sender_id, block.nbytes(), block.is_static());
            sbuf.synchronize(&block.data);
            conn.sbufs.push(sbuf);
            block.sbuf_conns.push(conn.id);
            self.events.push_back(RootEvent::MblkConnectedAsSource {
                handle: BlockHandle { id: block_id },
                connection: conn.id,
            });
        }

        if !conn.announced.contains(&block_id) && !conn.mbinfo_queue.contains(&block_id) {
            conn.mbinfo_queue.push_back(block_id);
        }
        Ok(())
    }

    fn handle_remove_request(&mut self, remote_ids: &[MblkId]) {
        for &id in remote_ids {
            let dynamic = self
                .blocks
                .get(&id)
                .is_some_and(|b| b.flags.contains(MblkFlags::DYNAMIC));
            if dynamic {
                if let Some(block) = self.blocks.remove(&id) {
                    self.forget_block(block);
                }
            }
        }
    }

    fn teardown_connection(
        &mut self,
        conn: &mut Connection<E::Instant>,
        now: E::Instant,
        reason: &str,
    ) {
        conn.fail(now, reason);
        for sbuf in conn.sbufs.drain(..) {
            if let Some(block) = self.blocks.get_mut(&sbuf.mblk_id) {
                block.sbuf_conns.retain(|&c| c != conn.id);
            }
        }
        for tbuf in conn.tbufs.drain(..) {
            if let Some(block) = self.blocks.get_mut(&tbuf.mblk_id) {
                block.tbuf_conns.retain(|&c| c != conn.id);
            }
        }
        conn.mbinfo_queue.clear();
        conn.announced.clear();
        conn.remove_queue.clear();

        // Devices whose last serving connection vanished.
        let mut dead_devices: Vec<(String, String, u32)> = Vec::new();
        for (net, dnet) in &mut self.dnetworks {
            let mut removed: Vec<(String, u32)> = Vec::new();
            for (key, conns) in &mut dnet.devices {
                conns.remove(&conn.id);
                if conns.is_empty() {
                    removed.push(key.clone());
                }
            }
            for key in removed {
                dnet.devices.remove(&key);
                dnet.remove_device_signals(&key.0, key.1);
                dead_devices.push((net.clone(), key.0, key.1));
            }
        }
        for (network_name, device_name, device_nr) in dead_devices {
            self.events.push_back(RootEvent::DeviceDisconnected {
                network_name,
                device_name,
                device_nr,
            });
        }

        // Dynamic blocks with no remaining attachments are released.
        let orphans: Vec<MblkId> = self
            .blocks
            .values()
            .filter(|b| {
                b.flags.contains(MblkFlags::DYNAMIC)
                    && b.sbuf_conns.is_empty()
                    && b.tbuf_conns.is_empty()
            })
            .map(|b| b.id)
            .collect();
        for id in orphans {
            if let Some(block) = self.blocks.remove(&id) {
                self.forget_block(block);
            }
        }

        let dead_nets: Vec<String> = self
            .dnetworks
            .iter()
            .filter(|(_, dnet)| dnet.is_empty())
            .map(|(net, _)| net.clone())
            .collect();
        for network_name in dead_nets {
            self.dnetworks.remove(&network_name);
            self.events.push_back(RootEvent::NetworkDisconnected { network_name });
        }
    }
}

/// A root behind a mutex, for thread-per-connection style deployments.
///
/// All mutation still serializes on one lock, exactly like the
/// single-threaded configuration; worker threads simply call
/// [`SharedRoot::run_once`] on their own schedule.
pub struct SharedRoot<E: Environment = SystemEnv> {
    inner: Arc<Mutex<Root<E>>>,
}

impl<E: Environment> Clone for SharedRoot<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> SharedRoot<E> {
    /// Wrap a root for shared use.
    #[must_use]
    pub fn new(root: Root<E>) -> Self {
        Self { inner: Arc::new(Mutex::new(root)) }
    }

    /// Lock the root for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Root<E>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// One scheduler pass under the lock.
    pub fn run_once(&self) {
        self.lock().run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Root {
        Root::new(RootConfig {
            device_name: "gina".to_string(),
            device_nr: 1,
            network_name: "cafenet".to_string(),
            ..RootConfig::default()
        })
    }

    #[test]
    fn block_creation_inherits_identity_and_fires_event() {
        let mut root = root();
        let handle = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "exp",
                nbytes: 32,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();

        let info = root.block_info(handle).unwrap();
        assert_eq!(info.device_name, "gina");
        assert_eq!(info.device_nr, 1);
        assert_eq!(info.network_name, "cafenet");
        assert!(info.flags.is_up());

        match root.poll_event() {
            Some(RootEvent::NewMemoryBlock { mblk_name, .. }) => {
                assert_eq!(mblk_name, "exp");
            }
            other => panic!("expected NewMemoryBlock, got {other:?}"),
        }
    }

    #[test]
    fn block_ids_start_above_reserved_range() {
        let mut root = root();
        let a = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "a",
                nbytes: 24,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();
        let b = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "b",
                nbytes: 24,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();
        assert!(a.id() >= MIN_MBLK_ID);
        assert_eq!(b.id(), a.id() + 1);
    }

    #[test]
    fn write_read_round_trip_with_callback() {
        use std::sync::{Arc as StdArc, Mutex as StdMutex};

        let mut root = root();
        let handle = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "exp",
                nbytes: 32,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();

        let hits = StdArc::new(StdMutex::new(0usize));
        let hits2 = StdArc::clone(&hits);
        root.add_callback(
            handle,
            Box::new(move |change| {
                assert_eq!(change.reason, ChangeReason::LocalWrite);
                if let Ok(mut guard) = hits2.lock() {
                    *guard += 1;
                }
            }),
        )
        .unwrap();

        root.write(handle, 4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        root.read(handle, 4, &mut out);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(*hits.lock().map_or_else(|e| e.into_inner(), |g| g), 1);
    }

    #[test]
    fn release_fires_deleted_event() {
        let mut root = root();
        let handle = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "exp",
                nbytes: 32,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();
        let _ = root.poll_event();

        root.release_memory_block(handle).unwrap();
        assert!(root.block_info(handle).is_none());
        match root.poll_event() {
            Some(RootEvent::MemoryBlockDeleted { mblk_name, .. }) => {
                assert_eq!(mblk_name, "exp");
            }
            other => panic!("expected MemoryBlockDeleted, got {other:?}"),
        }
        assert!(root.release_memory_block(handle).is_err());
    }

    #[test]
    fn find_block_matches_loosely() {
        let mut root = root();
        let handle = root
            .create_memory_block(&MemoryBlockParams {
                mblk_name: "exp",
                nbytes: 32,
                flags: MblkFlags::from_bits(MblkFlags::UP),
                ..MemoryBlockParams::default()
            })
            .unwrap();

        assert_eq!(root.find_block("", "", 0, "exp"), Some(handle));
        assert_eq!(root.find_block("cafenet", "gina", 1, "exp"), Some(handle));
        assert_eq!(root.find_block("othernet", "", 0, "exp"), None);
        assert_eq!(root.find_block("", "", 0, "imp"), None);
    }
}
