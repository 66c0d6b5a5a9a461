//! Object-Class Geometry
//!
//! Describes how an EC object class lays its records out: `k` data targets,
//! `p` parity targets and `cell_len` records per target per stripe. All of
//! the addressing arithmetic in this crate derives from these three numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of data targets
pub const EC_MAX_K: u32 = 64;

/// Maximum number of parity targets
pub const EC_MAX_P: u32 = 8;

/// Maximum number of targets in one EC group
pub const EC_MAX_TGT: u32 = EC_MAX_K + EC_MAX_P;

/// Alignment of a single-value cell
pub const SINGV_CELL_ALIGN: u64 = 8;

/// Single-value even-distribution unit
const SINGV_EVENDIST_UNIT: u64 = 4096;

// =============================================================================
// Object Class
// =============================================================================

/// Identifier of a registered object class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectClassId(pub u32);

impl fmt::Display for ObjectClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oc-{}", self.0)
    }
}

/// EC geometry of an object class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    k: u32,
    p: u32,
    cell_len: u64,
}

impl Geometry {
    /// Create a validated geometry
    ///
    /// # Arguments
    /// * `k` - Number of data targets, `1..=64`
    /// * `p` - Number of parity targets, `0..=8`
    /// * `cell_len` - Records per target per stripe, must be non-zero
    pub fn new(k: u32, p: u32, cell_len: u64) -> Result<Self> {
        if k == 0 || k > EC_MAX_K {
            return Err(Error::InvalidEcConfig(format!(
                "data targets must be in 1..={}, got {}",
                EC_MAX_K, k
            )));
        }
        if p > EC_MAX_P {
            return Err(Error::InvalidEcConfig(format!(
                "parity targets must be <= {}, got {}",
                EC_MAX_P, p
            )));
        }
        if cell_len == 0 {
            return Err(Error::InvalidEcConfig("cell_len must be > 0".into()));
        }
        if cell_len.checked_mul(k as u64).is_none() {
            return Err(Error::InvalidEcConfig(format!(
                "stripe of {} x {} records overflows",
                k, cell_len
            )));
        }
        Ok(Self { k, p, cell_len })
    }

    /// Number of data targets
    #[inline]
    pub fn k(&self) -> u32 {
        self.k
    }

    /// Number of parity targets
    #[inline]
    pub fn p(&self) -> u32 {
        self.p
    }

    /// Number of targets in the group (k + p)
    #[inline]
    pub fn tgt_nr(&self) -> u32 {
        self.k + self.p
    }

    /// Records held by one target within one stripe
    #[inline]
    pub fn cell_rec_nr(&self) -> u64 {
        self.cell_len
    }

    /// Records in one full stripe (data cells only)
    #[inline]
    pub fn stripe_rec_nr(&self) -> u64 {
        self.k as u64 * self.cell_len
    }

    /// Bytes in one cell for the given record size
    #[inline]
    pub fn cell_bytes(&self, rec_size: u64) -> u64 {
        self.cell_len * rec_size
    }

    /// Bytes of user data in one full stripe for the given record size
    #[inline]
    pub fn stripe_bytes(&self, rec_size: u64) -> u64 {
        self.stripe_rec_nr() * rec_size
    }

    /// Whether the logical target offset holds data (as opposed to parity)
    #[inline]
    pub fn is_data_tgt(&self, tgt_off: u32) -> bool {
        tgt_off < self.k
    }

    /// Whether the logical target offset holds parity
    #[inline]
    pub fn is_parity_tgt(&self, tgt_off: u32) -> bool {
        tgt_off >= self.k && tgt_off < self.tgt_nr()
    }

    // =========================================================================
    // Single Value Layout
    // =========================================================================

    /// Largest single value stored wholly on one data target
    pub fn singv_threshold(&self) -> u64 {
        (self.k as u64 / 8 + 1) * SINGV_EVENDIST_UNIT
    }

    /// Whether a single value of `size` bytes lives on one target
    pub fn singv_one_tgt(&self, size: u64) -> bool {
        size <= self.singv_threshold()
    }

    /// Cell size of an evenly distributed single value
    pub fn singv_cell_bytes(&self, gsize: u64) -> u64 {
        let cell = gsize.div_ceil(self.k as u64);
        cell.div_ceil(SINGV_CELL_ALIGN) * SINGV_CELL_ALIGN
    }

    /// Buffer needed to hold every target's cell of a single value
    pub fn singv_stripe_bytes(&self, gsize: u64) -> u64 {
        self.singv_cell_bytes(gsize) * self.tgt_nr() as u64
    }

    /// Local offset, size and padding of one target's part of a single value
    ///
    /// For updates the parity cells directly follow the user data so the
    /// last data target's padding never needs an extra segment. Fetches
    /// align every target on a cell boundary to keep recovery arithmetic
    /// uniform.
    pub fn singv_local(&self, gsize: u64, tgt_idx: u32, update: bool) -> Result<SingvLocal> {
        if tgt_idx >= self.tgt_nr() {
            return Err(Error::InvalidArgument(format!(
                "target {} out of range for {} targets",
                tgt_idx,
                self.tgt_nr()
            )));
        }
        let cell = self.singv_cell_bytes(gsize);
        let off = if tgt_idx >= self.k && update {
            gsize + (tgt_idx - self.k) as u64 * cell
        } else {
            tgt_idx as u64 * cell
        };

        if tgt_idx == self.k - 1 {
            let size = gsize
                .checked_sub((self.k as u64 - 1) * cell)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "single value of {} bytes too small to distribute over {} targets",
                        gsize, self.k
                    ))
                })?;
            Ok(SingvLocal {
                off,
                size,
                pad: cell - size,
            })
        } else {
            Ok(SingvLocal {
                off,
                size: cell,
                pad: 0,
            })
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{} (cell {} recs)", self.k, self.p, self.cell_len)
    }
}

/// One target's share of an evenly distributed single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingvLocal {
    /// Byte offset in the global value buffer
    pub off: u64,
    /// Bytes of real data this target holds
    pub size: u64,
    /// Zero bytes padding the cell
    pub pad: u64,
}

// =============================================================================
// Tests
// =============================================================================
