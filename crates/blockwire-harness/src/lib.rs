//! Deterministic simulation harness for the Blockwire fabric.
//!
//! Production code drives real sockets; tests drive the same engine over
//! in-memory pipes on a virtual clock. Nothing here sleeps or races: the
//! test advances time, ticks the roots and asserts on what moved.
//!
//! - [`sim`] - the simulated environment: clock, RNG, links, hub
//! - [`pair`] - ready-made device/controller fixtures

pub mod pair;
pub mod sim;

pub use pair::{device_controller_pair, Pair, PairOptions};
pub use sim::{SimEnv, SimHub, SimLink};

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
///
/// Call at the top of a test to see engine traces while debugging.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
