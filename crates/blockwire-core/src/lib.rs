//! Memory-block replication engine.
//!
//! Blockwire moves named, typed signals between small automation devices
//! and their controllers by replicating memory blocks - plain byte arrays
//! with an identity - across framed byte links. Each side writes its
//! authoritative blocks; the engine tracks invalidated ranges, snapshots
//! them, compresses the changes against the last transmitted state and
//! delivers them atomically on the far side.
//!
//! The crate is transport-agnostic: anything implementing [`link::Link`]
//! (TCP, TLS, a serial port, an in-memory pipe) carries the protocol.
//! Scheduling is poll-structured - drive everything from one loop with
//! [`root::Root::run`], or wrap the root in [`root::SharedRoot`] and tick
//! it from worker threads.
//!
//! ```
//! use blockwire_core::{
//!     mblk::{MblkFlags, MemoryBlockParams},
//!     root::{Root, RootConfig},
//! };
//!
//! let mut root = Root::new(RootConfig {
//!     device_name: "gina".to_string(),
//!     device_nr: 1,
//!     network_name: "cafenet".to_string(),
//!     ..RootConfig::default()
//! });
//! let exp = root
//!     .create_memory_block(&MemoryBlockParams {
//!         mblk_name: "exp",
//!         nbytes: 64,
//!         flags: MblkFlags::from_bits(MblkFlags::UP | MblkFlags::AUTO_SYNC),
//!         ..MemoryBlockParams::default()
//!     })
//!     .expect("block");
//!
//! // Writes record an invalidated range; attached connections pick the
//! // change up on the next `run()`.
//! root.write(exp, 0, &[1]).expect("write");
//! root.run();
//! ```

pub mod autonr;
pub mod connection;
pub mod discovery;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod link;
pub mod mblk;
pub mod persist;
pub(crate) mod sbuf;
pub mod signal;
pub(crate) mod tbuf;

pub mod root;

pub use autonr::AUTO_DEVICE_NR;
pub use connection::{ConnId, ConnStats, ConnState, ConnectionConfig, TransportTuning};
pub use env::{Environment, SystemEnv};
pub use error::{FabricError, Progress};
pub use mblk::{BlockHandle, MblkFlags, MemoryBlockParams, Swap};
pub use root::{Root, RootConfig, RootEvent, SharedRoot};
pub use signal::{Signal, SignalKind};

/// Wire-layer re-export for callers that build custom tooling.
pub use blockwire_proto as proto;
