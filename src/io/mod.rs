//! Object I/O over a group of targets
//!
//! - **Transport** (`transport.rs`): the shard request/reply seam
//! - **Target** (`target.rs`): target-side translation into an extent store
//! - **Memory** (`memory.rs`): in-process targets with fault injection
//! - **Object** (`object.rs`): update, fetch and degraded fetch

pub mod memory;
pub mod object;
pub mod target;
pub mod transport;

pub use memory::{MemStore, MemTransport};
pub use object::{dkey_hash, EcObject};
pub use target::{ExtentStore, TargetService};
pub use transport::{ShardReply, ShardRequest, ShardTransport};
