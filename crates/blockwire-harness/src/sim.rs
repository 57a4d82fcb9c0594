//! Simulated environment: virtual clock, seeded RNG, in-memory links.
//!
//! Everything timing-related in the engine reads the environment's clock,
//! so a test advances time explicitly and keepalives, timeouts and
//! reconnect delays become deterministic. Links are in-memory byte pipes
//! with a cut switch for fault injection.

use std::{
    collections::VecDeque,
    ops::Sub,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use blockwire_core::{
    env::Environment,
    error::FabricError,
    link::{Acceptor, Link},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Virtual instant: time since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0 - rhs.0
    }
}

/// Deterministic environment: virtual clock plus seeded RNG.
#[derive(Clone)]
pub struct SimEnv {
    now: Arc<Mutex<Duration>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// New environment at t=0 with a seeded RNG.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(Duration::ZERO)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Advance virtual time.
    pub fn advance(&self, delta: Duration) {
        *lock(&self.now) += delta;
    }

    /// Current virtual time since start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *lock(&self.now)
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(*lock(&self.now))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        lock(&self.rng).fill_bytes(buffer);
    }
}

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex byte stream.
///
/// Clones share the underlying pipes; a test typically hands one clone to
/// the root and keeps another to [`SimLink::cut`] the wire later.
#[derive(Clone)]
pub struct SimLink {
    rx: Arc<Mutex<Pipe>>,
    tx: Arc<Mutex<Pipe>>,
}

impl SimLink {
    /// A connected pair of link ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let ab = Arc::new(Mutex::new(Pipe::default()));
        let ba = Arc::new(Mutex::new(Pipe::default()));
        (
            Self { rx: Arc::clone(&ba), tx: Arc::clone(&ab) },
            Self { rx: ab, tx: ba },
        )
    }

    /// Sever the wire: both directions close and in-flight bytes are lost.
    pub fn cut(&self) {
        let mut rx = lock(&self.rx);
        rx.closed = true;
        rx.data.clear();
        drop(rx);
        let mut tx = lock(&self.tx);
        tx.closed = true;
        tx.data.clear();
    }

    /// Bytes currently queued toward this end.
    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.rx).data.len()
    }
}

impl Link for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FabricError> {
        let mut pipe = lock(&self.rx);
        if pipe.data.is_empty() {
            return if pipe.closed { Err(FabricError::StreamClosed) } else { Ok(0) };
        }
        let n = buf.len().min(pipe.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = pipe.data.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, FabricError> {
        let mut pipe = lock(&self.tx);
        if pipe.closed {
            return Err(FabricError::StreamClosed);
        }
        pipe.data.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), FabricError> {
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.tx).closed = true;
        lock(&self.rx).closed = true;
    }
}

/// Meeting point for simulated connections: clients dial, a listener
/// accepts.
#[derive(Clone, Default)]
pub struct SimHub {
    pending: Arc<Mutex<VecDeque<SimLink>>>,
    last_client: Arc<Mutex<Option<SimLink>>>,
}

impl SimHub {
    /// New empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dial: returns the client end and queues the server end for accept.
    #[must_use]
    pub fn connect(&self) -> SimLink {
        let (client, server) = SimLink::pair();
        lock(&self.pending).push_back(server);
        *lock(&self.last_client) = Some(client.clone());
        client
    }

    /// The most recently dialed client end (for cutting the active wire).
    #[must_use]
    pub fn last_client(&self) -> Option<SimLink> {
        lock(&self.last_client).clone()
    }

    /// Acceptor half, to hand to [`blockwire_core::root::Root::listen`].
    #[must_use]
    pub fn acceptor(&self) -> SimAcceptor {
        SimAcceptor { pending: Arc::clone(&self.pending) }
    }
}

/// Listener side of a [`SimHub`].
pub struct SimAcceptor {
    pending: Arc<Mutex<VecDeque<SimLink>>>,
}

impl Acceptor for SimAcceptor {
    fn accept(&mut self) -> Result<Option<Box<dyn Link>>, FabricError> {
        Ok(lock(&self.pending)
            .pop_front()
            .map(|link| Box::new(link) as Box<dyn Link>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipes_carry_bytes_both_ways() {
        let (mut a, mut b) = SimLink::pair();
        a.write(b"ping").unwrap();
        b.write(b"pong").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(a.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"pong");

        // Empty but open: would-block.
        assert_eq!(a.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn cut_loses_in_flight_bytes_and_closes() {
        let (mut a, mut b) = SimLink::pair();
        a.write(b"doomed").unwrap();
        a.cut();

        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf), Err(FabricError::StreamClosed));
        assert_eq!(a.write(b"x"), Err(FabricError::StreamClosed));
    }

    #[test]
    fn hub_queues_server_ends() {
        let hub = SimHub::new();
        let mut acceptor = hub.acceptor();
        assert!(acceptor.accept().unwrap().is_none());

        let mut client = hub.connect();
        let mut server = acceptor.accept().unwrap().unwrap();
        client.write(b"hi").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(server.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn virtual_clock_is_explicit() {
        let env = SimEnv::new(1);
        let t0 = env.now();
        env.advance(Duration::from_millis(100));
        let t1 = env.now();
        assert_eq!(t1 - t0, Duration::from_millis(100));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let a = SimEnv::new(42);
        let b = SimEnv::new(42);
        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.random_bytes(&mut buf_a);
        b.random_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
    }
}
