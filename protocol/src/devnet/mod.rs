//! # Devnet
//!
//! In-process stand-ins for every external collaborator: the transition
//! network, storage nodes and the peer transport. Each can be told to
//! misbehave. Used by the test suites and the daemon's `--devnet` mode.

pub mod fixtures;
pub mod network;
pub mod storage;
pub mod transport;

pub use network::InMemoryNetwork;
pub use storage::{InMemoryStorageNode, StorageBackend};
pub use transport::{LoopbackHub, LoopbackTransport};
