//! I/O Descriptor Model
//!
//! An [`Iod`] describes one attribute value of a request. After reassembly
//! each IOD is paired with an [`ObjectIod`] telling which slice of its
//! extent array and buffer belongs to which target.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::recx::Recx;
use crate::error::{Error, Result};

/// Kind of attribute value an IOD addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IodType {
    /// One scalar value of `size` bytes
    Single,
    /// Array of records of `size` bytes each
    Array,
}

/// I/O descriptor for one attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iod {
    pub akey: String,
    pub iod_type: IodType,
    /// Record size for arrays, value size for single values
    pub size: u64,
    pub recxs: Vec<Recx>,
    /// Optional checksum per extent
    pub csums: Option<Vec<Bytes>>,
}

impl Iod {
    pub fn array(akey: impl Into<String>, rec_size: u64, recxs: Vec<Recx>) -> Self {
        Self {
            akey: akey.into(),
            iod_type: IodType::Array,
            size: rec_size,
            recxs,
            csums: None,
        }
    }

    pub fn single(akey: impl Into<String>, size: u64) -> Self {
        Self {
            akey: akey.into(),
            iod_type: IodType::Single,
            size,
            recxs: Vec::new(),
            csums: None,
        }
    }

    pub fn with_csums(mut self, csums: Vec<Bytes>) -> Self {
        self.csums = Some(csums);
        self
    }

    pub fn is_single(&self) -> bool {
        self.iod_type == IodType::Single
    }

    /// Bytes of user data the IOD covers
    pub fn data_bytes(&self) -> u64 {
        match self.iod_type {
            IodType::Single => self.size,
            IodType::Array => self.recxs.iter().map(|r| r.nr * self.size).sum(),
        }
    }

    /// Copy of this IOD restricted to the given extent range
    pub(crate) fn slice(&self, idx: usize, nr: usize) -> Self {
        Self {
            akey: self.akey.clone(),
            iod_type: self.iod_type,
            size: self.size,
            recxs: self.recxs.get(idx..idx + nr).unwrap_or_default().to_vec(),
            csums: self
                .csums
                .as_ref()
                .map(|c| c.get(idx..(idx + nr).min(c.len())).unwrap_or_default().to_vec()),
        }
    }

    /// Validate an IOD arriving from a client
    pub fn validate_ingress(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidArgument(format!(
                "iod {} has zero size",
                self.akey
            )));
        }
        match self.iod_type {
            IodType::Single => {
                if !self.recxs.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "single value iod {} carries extents",
                        self.akey
                    )));
                }
            }
            IodType::Array => {
                if self.recxs.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "array iod {} has no extents",
                        self.akey
                    )));
                }
                for recx in &self.recxs {
                    recx.validate_user()?;
                }
            }
        }
        if let Some(csums) = &self.csums {
            if csums.len() != self.recxs.len() {
                return Err(Error::InvalidArgument(format!(
                    "iod {} has {} checksums for {} extents",
                    self.akey,
                    csums.len(),
                    self.recxs.len()
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Shard Descriptors
// =============================================================================

/// Slice of one IOD routed to one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIod {
    /// Logical target, `[0, k + p)`
    pub tgt_idx: u32,
    /// First extent in the reassembled extent array
    pub idx: u32,
    /// Byte offset of this target's data in the reassembled buffer
    pub off: u64,
    /// Number of extents
    pub nr: u32,
}

/// Placement of a single value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SingvPlacement {
    /// Whole value on one data target, copied to the listed replicas
    OneTarget { tgt_idx: u32, replicas: Vec<u32> },
    /// Striped over the first `tgt_nr` logical targets
    EvenDist { tgt_nr: u32 },
}

/// Per-IOD routing produced by reassembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectIod {
    /// Replicated object, every target gets the same extents
    Replica,
    /// All extents go to one target unchanged
    Direct { tgt_idx: u32, nr: u32 },
    /// General case, one descriptor per involved target in target order
    Sharded(Vec<ShardIod>),
    /// Full stripes only
    ///
    /// Every data target holds `data_nr` extents and every parity target
    /// `parity_nr`, each target contributing `tgt_bytes` bytes.
    EvenDist {
        data_tgts: u32,
        parity_tgts: u32,
        data_nr: u32,
        parity_nr: u32,
        tgt_bytes: u64,
    },
    SingleValue(SingvPlacement),
}

impl ObjectIod {
    /// Shard descriptors, recomputed for the compact variants
    pub fn siods(&self) -> Vec<ShardIod> {
        match self {
            ObjectIod::Replica | ObjectIod::SingleValue(_) => Vec::new(),
            ObjectIod::Direct { tgt_idx, nr } => vec![ShardIod {
                tgt_idx: *tgt_idx,
                idx: 0,
                off: 0,
                nr: *nr,
            }],
            ObjectIod::Sharded(siods) => siods.clone(),
            ObjectIod::EvenDist {
                data_tgts,
                parity_tgts,
                ..
            } => (0..data_tgts + parity_tgts)
                .filter_map(|t| self.shard_iod(t))
                .collect(),
        }
    }

    /// Descriptor of one target, if it is involved
    pub fn shard_iod(&self, tgt: u32) -> Option<ShardIod> {
        match self {
            ObjectIod::Replica | ObjectIod::SingleValue(_) => None,
            ObjectIod::Direct { tgt_idx, nr } => (*tgt_idx == tgt).then_some(ShardIod {
                tgt_idx: tgt,
                idx: 0,
                off: 0,
                nr: *nr,
            }),
            ObjectIod::Sharded(siods) => siods.iter().find(|s| s.tgt_idx == tgt).copied(),
            ObjectIod::EvenDist {
                data_tgts,
                parity_tgts,
                data_nr,
                parity_nr,
                tgt_bytes,
            } => {
                if tgt < *data_tgts {
                    Some(ShardIod {
                        tgt_idx: tgt,
                        idx: tgt * data_nr,
                        off: tgt as u64 * tgt_bytes,
                        nr: *data_nr,
                    })
                } else if tgt < data_tgts + parity_tgts {
                    let p_idx = tgt - data_tgts;
                    Some(ShardIod {
                        tgt_idx: tgt,
                        idx: data_tgts * data_nr + p_idx * parity_nr,
                        off: tgt as u64 * tgt_bytes,
                        nr: *parity_nr,
                    })
                } else {
                    None
                }
            }
        }
    }

    pub fn is_even_dist(&self) -> bool {
        matches!(
            self,
            ObjectIod::EvenDist { .. }
                | ObjectIod::SingleValue(SingvPlacement::EvenDist { .. })
        )
    }

    /// Logical targets this IOD addresses, ascending
    pub fn targets(&self) -> Vec<u32> {
        match self {
            ObjectIod::SingleValue(SingvPlacement::OneTarget { tgt_idx, replicas }) => {
                let mut tgts = Vec::with_capacity(1 + replicas.len());
                tgts.push(*tgt_idx);
                tgts.extend(replicas.iter().copied());
                tgts.sort_unstable();
                tgts.dedup();
                tgts
            }
            ObjectIod::SingleValue(SingvPlacement::EvenDist { tgt_nr }) => (0..*tgt_nr).collect(),
            other => other.siods().iter().map(|s| s.tgt_idx).collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::recx::PARITY_INDICATOR;
    use assert_matches::assert_matches;

    #[test]
    fn test_iod_data_bytes() {
        let iod = Iod::array("a", 8, vec![Recx::new(0, 10), Recx::new(100, 6)]);
        assert_eq!(iod.data_bytes(), 128);
        assert_eq!(Iod::single("s", 5000).data_bytes(), 5000);
    }

    #[test]
    fn test_slice_clamps_short_checksums() {
        let iod = Iod::array("a", 1, vec![Recx::new(0, 1), Recx::new(4, 1), Recx::new(8, 1)])
            .with_csums(vec![Bytes::from_static(b"c0")]);
        let tail = iod.slice(1, 2);
        assert_eq!(tail.recxs, vec![Recx::new(4, 1), Recx::new(8, 1)]);
        assert_eq!(tail.csums, Some(Vec::new()));
        assert!(iod.slice(3, 2).recxs.is_empty());
    }

    #[test]
    fn test_validate_ingress() {
        assert!(Iod::array("a", 8, vec![Recx::new(0, 1)])
            .validate_ingress()
            .is_ok());
        assert_matches!(
            Iod::array("a", 8, vec![Recx::new(PARITY_INDICATOR, 1)]).validate_ingress(),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Iod::array("a", 0, vec![Recx::new(0, 1)]).validate_ingress(),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Iod::array("a", 8, vec![]).validate_ingress(),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Iod::array("a", 8, vec![Recx::new(0, 1)])
                .with_csums(vec![])
                .validate_ingress(),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_even_dist_siods() {
        // 2 full stripes in one extent, k=4 p=2, cell of 16 records of 8 bytes
        let oiod = ObjectIod::EvenDist {
            data_tgts: 4,
            parity_tgts: 2,
            data_nr: 2,
            parity_nr: 1,
            tgt_bytes: 2 * 16 * 8,
        };
        let siods = oiod.siods();
        assert_eq!(siods.len(), 6);
        assert_eq!(
            siods[2],
            ShardIod {
                tgt_idx: 2,
                idx: 4,
                off: 512,
                nr: 2
            }
        );
        assert_eq!(
            siods[5],
            ShardIod {
                tgt_idx: 5,
                idx: 9,
                off: 1280,
                nr: 1
            }
        );
        assert!(oiod.shard_iod(6).is_none());
        assert!(oiod.is_even_dist());
    }

    #[test]
    fn test_direct_and_singv_targets() {
        let direct = ObjectIod::Direct { tgt_idx: 3, nr: 2 };
        assert_eq!(direct.targets(), vec![3]);
        assert!(direct.shard_iod(1).is_none());
        assert_eq!(direct.shard_iod(3).unwrap().nr, 2);

        let small = ObjectIod::SingleValue(SingvPlacement::OneTarget {
            tgt_idx: 0,
            replicas: vec![4, 5],
        });
        assert_eq!(small.targets(), vec![0, 4, 5]);
        assert!(small.siods().is_empty());

        let even = ObjectIod::SingleValue(SingvPlacement::EvenDist { tgt_nr: 6 });
        assert_eq!(even.targets().len(), 6);
        assert!(ObjectIod::Replica.targets().is_empty());
    }
}
