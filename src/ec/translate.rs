//! Coordinate Translator
//!
//! Stateless arithmetic between the three coordinate spaces of an EC object:
//!
//! ```text
//! logical index  ──logical_to_physical──►  per-target physical index
//!        ▲                                          │
//!        └──────────physical_to_logical(tgt)────────┘
//!
//! parity index = physical index | PARITY_INDICATOR
//! ```
//!
//! Data targets store their cells at the mapped physical index. Parity
//! targets store parity at the same physical index with the parity
//! indicator set.

use serde::{Deserialize, Serialize};

use super::geometry::Geometry;
use super::recx::{clear_parity, set_parity, Recx, RecxEpList};
use crate::error::{try_alloc, Error, Result};

#[inline]
fn roundup(x: u64, unit: u64) -> u64 {
    x.div_ceil(unit) * unit
}

#[inline]
fn rounddown(x: u64, unit: u64) -> u64 {
    x / unit * unit
}

// =============================================================================
// Index Mapping
// =============================================================================

/// Map a logical record index to its physical index on the owning target
#[inline]
pub fn logical_to_physical(geo: &Geometry, idx: u64) -> u64 {
    let cell = geo.cell_rec_nr();
    (idx / geo.stripe_rec_nr()) * cell + idx % cell
}

/// Map a physical index on data target `tgt` back to its logical index
#[inline]
pub fn physical_to_logical(geo: &Geometry, phys: u64, tgt: u32) -> u64 {
    let cell = geo.cell_rec_nr();
    (phys / cell) * geo.stripe_rec_nr() + tgt as u64 * cell + phys % cell
}

/// Logical start of the stripe holding the parity at physical offset `vos_off`
#[inline]
pub fn parity_to_logical(geo: &Geometry, vos_off: u64) -> u64 {
    (vos_off / geo.cell_rec_nr()) * geo.stripe_rec_nr()
}

/// Data target owning a logical index
#[inline]
pub fn tgt_of_idx(geo: &Geometry, idx: u64) -> u32 {
    ((idx % geo.stripe_rec_nr()) / geo.cell_rec_nr()) as u32
}

// =============================================================================
// Extent Breaking
// =============================================================================

/// Number of cells an extent touches, at least one
pub fn recx_cell_nr(geo: &Geometry, recx: &Recx) -> u64 {
    let cell = geo.cell_rec_nr();
    let end = recx.end();
    let start = roundup(recx.idx, cell);
    let last = rounddown(end, cell);
    if start > last {
        return 1;
    }
    (last - start) / cell + u64::from(recx.idx % cell != 0) + u64::from(end % cell != 0)
}

/// Split an extent on cell boundaries
///
/// Every piece lies in one cell. Only the first may start mid-cell.
pub fn break_recx(geo: &Geometry, recx: &Recx) -> Result<Vec<Recx>> {
    let cell = geo.cell_rec_nr();
    let nr = recx_cell_nr(geo, recx) as usize;
    let mut out = try_alloc(nr, "broken recxs")?;

    let mut idx = recx.idx;
    let end = recx.end();
    while idx < end {
        let piece_end = (rounddown(idx, cell) + cell).min(end);
        out.push(Recx::new(idx, piece_end - idx));
        idx = piece_end;
    }
    Ok(out)
}

/// Split every extent of a list on cell boundaries, preserving order
pub fn break_recxs(geo: &Geometry, recxs: &[Recx]) -> Result<Vec<Recx>> {
    let total: u64 = recxs.iter().map(|r| recx_cell_nr(geo, r)).sum();
    let mut out = try_alloc(total as usize, "broken recxs")?;
    for recx in recxs {
        out.extend(break_recx(geo, recx)?);
    }
    Ok(out)
}

// =============================================================================
// List Translation
// =============================================================================

/// Map logical extents to physical extents on their data target
///
/// Each extent must lie within one cell.
pub fn recxs_to_physical(geo: &Geometry, recxs: &[Recx]) -> Result<Vec<Recx>> {
    recxs
        .iter()
        .map(|r| {
            if r.is_parity() {
                return Err(Error::InvalidArgument(format!(
                    "cannot map parity extent {} as data",
                    r
                )));
            }
            if recx_cell_nr(geo, r) != 1 {
                return Err(Error::InvalidArgument(format!(
                    "extent {} spans more than one cell",
                    r
                )));
            }
            Ok(Recx::new(logical_to_physical(geo, r.idx), r.nr))
        })
        .collect()
}

/// Map physical extents read from data target `tgt` back to logical extents
///
/// One physical extent can cover several stripes, so the list is broken on
/// cell boundaries first.
pub fn recxs_to_logical(geo: &Geometry, recxs: &[Recx], tgt: u32) -> Result<Vec<Recx>> {
    let mut out = break_recxs(geo, recxs)?;
    for r in out.iter_mut() {
        if r.is_parity() {
            return Err(Error::InvalidArgument(format!(
                "cannot map parity extent {} as data",
                r
            )));
        }
        r.idx = physical_to_logical(geo, r.idx, tgt);
    }
    Ok(out)
}

/// Move extents into the parity range
pub fn recxs_to_parity(recxs: &[Recx]) -> Result<Vec<Recx>> {
    recxs
        .iter()
        .map(|r| Ok(Recx::new(set_parity(r.idx)?, r.nr)))
        .collect()
}

/// Move extents out of the parity range
pub fn recxs_from_parity(recxs: &[Recx]) -> Result<Vec<Recx>> {
    recxs
        .iter()
        .map(|r| Ok(Recx::new(clear_parity(r.idx)?, r.nr)))
        .collect()
}

/// Translate parity shadow lists reported by a parity target into the
/// logical full-stripe ranges they protect
pub fn shadow_list_to_logical(geo: &Geometry, lists: &mut [RecxEpList]) -> Result<()> {
    let cell = geo.cell_rec_nr();
    for list in lists.iter_mut() {
        for item in list.items.iter_mut() {
            let recx = &mut item.recx;
            recx.idx = clear_parity(recx.idx)?;
            let end = roundup(recx.end(), cell) * geo.k() as u64;
            recx.idx = physical_to_logical(geo, rounddown(recx.idx, cell), 0);
            recx.nr = end - recx.idx;
        }
    }
    Ok(())
}

// =============================================================================
// Target Rotation
// =============================================================================

const JUMP_HASH_MUL: u64 = 2862933555777941757;

fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(JUMP_HASH_MUL).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

/// First target slot of a group for a key hash
///
/// Layout version 0 uses a plain modulo. Later versions use jump consistent
/// hashing.
pub fn group_start(layout_ver: u16, hash: u64, grp_size: u32) -> u32 {
    if grp_size == 0 {
        return 0;
    }
    if layout_ver == 0 {
        (hash % grp_size as u64) as u32
    } else {
        jump_hash(hash, grp_size)
    }
}

/// Rotation of logical target offsets onto the physical shards of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRotation {
    start: u32,
    k: u32,
    tgt_nr: u32,
}

impl TargetRotation {
    pub fn new(geo: &Geometry, layout_ver: u16, hash: u64) -> Self {
        Self {
            start: group_start(layout_ver, hash, geo.tgt_nr()),
            k: geo.k(),
            tgt_nr: geo.tgt_nr(),
        }
    }

    /// Physical shard of logical offset 0
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Physical shard holding logical target offset `tgt_off`
    #[inline]
    pub fn shard_idx(&self, tgt_off: u32) -> u32 {
        (self.start + tgt_off) % self.tgt_nr
    }

    /// Logical target offset of a physical shard
    #[inline]
    pub fn tgt_off(&self, shard: u32) -> u32 {
        (shard % self.tgt_nr + self.tgt_nr - self.start) % self.tgt_nr
    }

    /// Physical shard of the `p_idx`-th parity target
    pub fn parity_shard(&self, p_idx: u32) -> u32 {
        self.shard_idx(self.k + p_idx)
    }

    pub fn is_data_shard(&self, shard: u32) -> bool {
        self.tgt_off(shard) < self.k
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::recx::PARITY_INDICATOR;

    fn geo() -> Geometry {
        Geometry::new(4, 2, 16).unwrap()
    }

    #[test]
    fn test_index_mapping() {
        let g = geo();
        // stripe 1, target 2, offset 3
        let idx = 64 + 2 * 16 + 3;
        assert_eq!(tgt_of_idx(&g, idx), 2);
        let phys = logical_to_physical(&g, idx);
        assert_eq!(phys, 16 + 3);
        assert_eq!(physical_to_logical(&g, phys, 2), idx);
        assert_eq!(parity_to_logical(&g, phys), 64);
    }

    #[test]
    fn test_cell_nr() {
        let g = geo();
        assert_eq!(recx_cell_nr(&g, &Recx::new(0, 16)), 1);
        assert_eq!(recx_cell_nr(&g, &Recx::new(0, 48)), 3);
        assert_eq!(recx_cell_nr(&g, &Recx::new(0, 63)), 4);
        assert_eq!(recx_cell_nr(&g, &Recx::new(5, 3)), 1);
        assert_eq!(recx_cell_nr(&g, &Recx::new(10, 10)), 2);
        assert_eq!(recx_cell_nr(&g, &Recx::new(10, 40)), 4);
    }

    #[test]
    fn test_break_recx() {
        let g = geo();
        let pieces = break_recx(&g, &Recx::new(10, 40)).unwrap();
        assert_eq!(
            pieces,
            vec![
                Recx::new(10, 6),
                Recx::new(16, 16),
                Recx::new(32, 16),
                Recx::new(48, 2)
            ]
        );

        let pieces = break_recx(&g, &Recx::new(0, 80)).unwrap();
        assert_eq!(pieces.len(), 5);
        assert!(pieces.iter().all(|p| p.nr == 16 && p.idx % 16 == 0));

        let all = break_recxs(&g, &[Recx::new(0, 16), Recx::new(20, 20)]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_recxs_to_physical_and_back() {
        let g = geo();
        let phys = recxs_to_physical(&g, &[Recx::new(64 + 32, 16)]).unwrap();
        assert_eq!(phys, vec![Recx::new(16, 16)]);
        let logical = recxs_to_logical(&g, &phys, 2).unwrap();
        assert_eq!(logical, vec![Recx::new(96, 16)]);

        // physical [0, 32) on target 1 covers two stripes
        let logical = recxs_to_logical(&g, &[Recx::new(0, 32)], 1).unwrap();
        assert_eq!(logical, vec![Recx::new(16, 16), Recx::new(80, 16)]);

        assert!(recxs_to_physical(&g, &[Recx::new(10, 10)]).is_err());
    }

    #[test]
    fn test_parity_lists() {
        let r = [Recx::new(0, 16)];
        let p = recxs_to_parity(&r).unwrap();
        assert_eq!(p[0].idx, PARITY_INDICATOR);
        assert!(recxs_to_parity(&p).is_err());
        assert_eq!(recxs_from_parity(&p).unwrap(), r);
        assert!(recxs_from_parity(&r).is_err());
    }

    #[test]
    fn test_shadow_list_to_logical() {
        let g = geo();
        let mut lists = vec![RecxEpList::new(true)];
        // parity for physical [16, 48) covers stripes 1 and 2
        lists[0].push(Recx::new(PARITY_INDICATOR | 16, 32), 3, 8);
        shadow_list_to_logical(&g, &mut lists).unwrap();
        assert_eq!(lists[0].items[0].recx, Recx::new(64, 128));

        // partial cell rounds out to whole stripes
        let mut lists = vec![RecxEpList::new(true)];
        lists[0].push(Recx::new(PARITY_INDICATOR | 4, 4), 3, 8);
        shadow_list_to_logical(&g, &mut lists).unwrap();
        assert_eq!(lists[0].items[0].recx, Recx::new(0, 64));
    }

    #[test]
    fn test_group_start_versions() {
        assert_eq!(group_start(0, 17, 6), 5);
        for hash in [0u64, 1, 42, u64::MAX, 0xdead_beef] {
            let s = group_start(1, hash, 6);
            assert!(s < 6);
            assert_eq!(s, group_start(1, hash, 6));
        }
        assert_eq!(group_start(1, 7, 1), 0);
    }

    #[test]
    fn test_rotation() {
        let g = geo();
        let rot = TargetRotation::new(&g, 0, 3);
        assert_eq!(rot.start(), 3);
        assert_eq!(rot.shard_idx(0), 3);
        assert_eq!(rot.shard_idx(3), 0);
        assert_eq!(rot.parity_shard(0), 1);
        assert_eq!(rot.parity_shard(1), 2);
        assert!(rot.is_data_shard(0));
        assert!(!rot.is_data_shard(1));
        for t in 0..g.tgt_nr() {
            assert_eq!(rot.tgt_off(rot.shard_idx(t)), t);
        }
    }
}
