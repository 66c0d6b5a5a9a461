//! ecobj - Erasure-Coded Object Core
//!
//! Addressing, request splitting and degraded-read recovery for objects
//! striped over `k` data targets with `p` Reed-Solomon parity targets.
//!
//! # Architecture
//!
//! ```text
//! Client IODs → Reassembler → Leader split → Targets
//!                                              │
//!                   user buffers ◄── Recovery ◄┘ (on target failure)
//! ```
//!
//! # Modules
//!
//! - [`ec`] - Geometry, codecs, coordinate translation, reassembly and recovery
//! - [`io`] - Transport seam, target handler, in-memory targets and the object API
//! - [`config`] - Object-class catalog and I/O tuning
//! - [`metrics`] - Prometheus counters
//! - [`error`] - Error types

pub mod config;
pub mod ec;
pub mod error;
pub mod io;
pub mod metrics;

// Re-export commonly used types
pub use config::{EcConfig, IoConfig};
pub use ec::{CodecRegistry, Geometry, Iod, ObjectClassId, Recx};
pub use error::{Error, ErrorKind, Result};
pub use io::{EcObject, MemTransport};
pub use metrics::EcMetrics;
