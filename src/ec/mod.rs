//! Erasure Coding Module
//!
//! Addressing, request splitting and degraded-read recovery for objects
//! striped over `k` data targets and protected by `p` parity targets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           EC Object Core                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │  │   Geometry   │───►│  Translator  │───►│  Reassembler / Splitter   │  │
//! │  │   + Codecs   │    │  + Rotation  │    │  (sorter, parity encode)  │  │
//! │  └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │         │                   │                         │                 │
//! │         └───────────────────┼─────────────────────────┘                 │
//! │                             │                                           │
//! │                   ┌─────────┴─────────┐                                 │
//! │                   │  Failure/Recovery │                                 │
//! │                   │      Engine       │                                 │
//! │                   └───────────────────┘                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Geometry** (`geometry.rs`): `k`, `p` and cell length of an object
//!   class, plus the single-value layout.
//! - **GF primitives** (`gf.rs`): encode matrix generation, inversion and
//!   table-driven vector multiply over GF(2^8).
//! - **Codec Registry** (`codec.rs`): one codec per `(k, p)`, built once and
//!   shared read-only.
//! - **Extents** (`recx.rs`): extents, the parity indicator and recx-epoch
//!   list reconciliation.
//! - **Translator** (`translate.rs`): logical, physical and parity
//!   coordinates, cell breaking and target rotation.
//! - **Descriptors** (`iod.rs`): IODs and their per-target routing.
//! - **Segment Sorter** (`sorter.rs`): per-target fragment buckets.
//! - **Reassembler** (`reasb.rs`) and **Splitter** (`split.rs`): the leader
//!   protocol, including full-stripe parity.
//! - **Recovery** (`recovery.rs`): failed-target tracking, decode tables and
//!   recovery tasks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ecobj::ec::{reassemble, CodecRegistry, Iod, ObjectClassId, Recx};
//!
//! let registry = CodecRegistry::from_config(&EcConfig::default())?;
//! let class = registry.by_name("EC_4P2").unwrap();
//!
//! let iods = vec![Iod::array("akey", 1, vec![Recx::new(0, 80)])];
//! let req = reassemble(class, &iods, &[], false)?;
//! assert_eq!(req.targets(), &[0, 1, 2, 3]);
//! ```

pub mod codec;
pub mod geometry;
pub mod gf;
pub mod iod;
pub mod reasb;
pub mod recovery;
pub mod recx;
pub mod sorter;
pub mod split;
pub mod translate;

#[cfg(test)]
mod proptest;

pub use codec::{ClassEntry, Codec, CodecRegistry, CodecRegistryBuilder};
pub use geometry::{Geometry, ObjectClassId, SingvLocal, EC_MAX_K, EC_MAX_P, EC_MAX_TGT};
pub use iod::{Iod, IodType, ObjectIod, ShardIod, SingvPlacement};
pub use reasb::{reassemble, Fragment, FullStripeRecx, FullStripeRecxArray, ReasbRequest};
pub use recovery::{FailInfo, RecoveryCodec, RecoveryRange, RecoveryState, RecoveryTask, Redirect};
pub use recx::{
    clear_parity, parity_lists_match, set_parity, AddrSpace, Recx, RecxEp, RecxEpList, SpacedRecx,
    PARITY_INDICATOR,
};
pub use sorter::SegmentSorter;
pub use split::{leader_tgt, split_request, SplitRequest, TargetIod, TargetOiod};
pub use translate::{group_start, TargetRotation};
