//! Environment abstraction for deterministic testing.
//!
//! Decouples the engine from system resources (time, randomness). The
//! production environment reads the monotonic clock and the thread RNG;
//! the simulation harness substitutes a virtual clock and a seeded RNG so
//! every keepalive, timeout and reconnect is reproducible.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

/// Abstract environment providing time and randomness.
///
/// Implementations must guarantee that `now()` never goes backwards within
/// one execution context.
pub trait Environment: Clone + Send + 'static {
    /// The instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; simulations use virtual time.
    type Instant: Copy + Ord + Send + Sub<Output = Duration> + core::fmt::Debug;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u32` convenience.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Random value in `lo..=hi`.
    fn random_range(&self, lo: u32, hi: u32) -> u32 {
        debug_assert!(lo <= hi);
        let span = u64::from(hi - lo) + 1;
        lo + (u64::from(self.random_u32()) % span) as u32
    }
}

/// Production environment: system clock and thread RNG.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}
