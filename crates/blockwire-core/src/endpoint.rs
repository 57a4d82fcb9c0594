//! End point: a listening stream that spawns acceptor-role connections.

use std::time::Duration;

use crate::{connection::ConnectionConfig, link::Acceptor};

/// Process-unique end point identifier.
pub type EndPointId = u32;

/// Minimum interval between accept attempts.
pub(crate) const ACCEPT_THROTTLE: Duration = Duration::from_millis(50);

/// A listener owned by the root.
pub(crate) struct EndPoint<I> {
    pub id: EndPointId,
    pub acceptor: Box<dyn Acceptor>,
    /// Template configuration for accepted connections
    pub conn_cfg: ConnectionConfig,
    pub last_attempt: Option<I>,
    pub failed: bool,
}

impl<I: Copy> EndPoint<I> {
    pub fn new(id: EndPointId, acceptor: Box<dyn Acceptor>, conn_cfg: ConnectionConfig) -> Self {
        Self { id, acceptor, conn_cfg, last_attempt: None, failed: false }
    }
}
