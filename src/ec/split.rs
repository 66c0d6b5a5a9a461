//! Leader-side request split
//!
//! The leader receives the reassembled request and cuts it into one
//! [`TargetOiod`] per involved target. It keeps its own part and forwards
//! the others.

use bytes::Bytes;
use tracing::{debug, instrument};

use super::geometry::Geometry;
use super::iod::{Iod, ObjectIod, ShardIod, SingvPlacement};
use super::recx::Recx;
use crate::error::{try_alloc, Error, Result};

/// One IOD's share for a target
#[derive(Debug, Clone)]
pub struct TargetIod {
    /// Index of the IOD in the request
    pub iod_idx: usize,
    /// Extents, record size and checksums for this target only
    pub iod: Iod,
    /// Byte offset of this target's data in the reassembled buffer
    pub off: u64,
    /// Bytes of data this target reads or writes
    pub len: u64,
    /// Descriptor this share was cut from, `None` for single values
    pub siod: Option<ShardIod>,
}

/// Everything one target receives
#[derive(Debug, Clone)]
pub struct TargetOiod {
    /// Logical target the request is sent to
    pub tgt_idx: u32,
    /// Logical target whose data is addressed, differs from `tgt_idx` when
    /// a fetch is redirected to a parity replica
    pub orig_tgt_idx: u32,
    pub iods: Vec<TargetIod>,
}

impl TargetOiod {
    /// Shard descriptors of the array IODs
    pub fn shard_iods(&self) -> Vec<ShardIod> {
        self.iods.iter().filter_map(|t| t.siod).collect()
    }

    /// Slice this target's bytes out of the reassembled buffers
    pub fn extract_data(&self, sgls: &[Bytes]) -> Result<Vec<Bytes>> {
        self.iods
            .iter()
            .map(|t| {
                let sgl = sgls.get(t.iod_idx).ok_or_else(|| {
                    Error::InvalidArgument(format!("no buffer for iod {}", t.iod_idx))
                })?;
                let end = t.off + t.len;
                if end > sgl.len() as u64 {
                    return Err(Error::InvalidArgument(format!(
                        "target {} needs bytes [{}, {}) of a {} byte buffer",
                        self.tgt_idx,
                        t.off,
                        end,
                        sgl.len()
                    )));
                }
                Ok(sgl.slice(t.off as usize..end as usize))
            })
            .collect()
    }

    /// The per-target IODs, in request order
    pub fn target_iods(&self) -> Vec<Iod> {
        self.iods.iter().map(|t| t.iod.clone()).collect()
    }
}

/// The leader's part plus the forwards
#[derive(Debug, Clone)]
pub struct SplitRequest {
    pub leader: TargetOiod,
    pub forwards: Vec<TargetOiod>,
}

impl SplitRequest {
    /// Leader first, then forwards in target order
    pub fn all(&self) -> impl Iterator<Item = &TargetOiod> {
        std::iter::once(&self.leader).chain(self.forwards.iter())
    }

    pub fn into_all(self) -> Vec<TargetOiod> {
        let mut all = Vec::with_capacity(1 + self.forwards.len());
        all.push(self.leader);
        all.extend(self.forwards);
        all
    }
}

/// Target that coordinates an update
///
/// The last parity target when parity is involved, otherwise the lowest
/// target.
pub fn leader_tgt(geo: &Geometry, targets: &[u32]) -> Option<u32> {
    let last = geo.tgt_nr() - 1;
    if geo.p() > 0 && targets.contains(&last) {
        return Some(last);
    }
    targets.iter().copied().min()
}

/// Bytes covered by extents of a reassembled IOD on one target
pub(crate) fn recxs_bytes(geo: &Geometry, recxs: &[Recx], rec_size: u64) -> u64 {
    recxs
        .iter()
        .map(|r| {
            if r.is_parity() {
                r.nr / geo.stripe_rec_nr() * geo.cell_bytes(rec_size)
            } else {
                r.nr * rec_size
            }
        })
        .sum()
}

/// Share of one IOD for one target, `None` if the target is not involved
pub(crate) fn target_iod(
    geo: &Geometry,
    iod_idx: usize,
    iod: &Iod,
    oiod: &ObjectIod,
    tgt: u32,
    update: bool,
) -> Result<Option<TargetIod>> {
    match oiod {
        ObjectIod::Replica => Ok(Some(TargetIod {
            iod_idx,
            iod: iod.clone(),
            off: 0,
            len: iod.data_bytes(),
            siod: None,
        })),
        ObjectIod::SingleValue(SingvPlacement::OneTarget { .. }) => {
            if !oiod.targets().contains(&tgt) {
                return Ok(None);
            }
            Ok(Some(TargetIod {
                iod_idx,
                iod: iod.clone(),
                off: 0,
                len: iod.size,
                siod: None,
            }))
        }
        ObjectIod::SingleValue(SingvPlacement::EvenDist { tgt_nr }) => {
            if tgt >= *tgt_nr {
                return Ok(None);
            }
            let loc = geo.singv_local(iod.size, tgt, update)?;
            Ok(Some(TargetIod {
                iod_idx,
                iod: iod.clone(),
                off: loc.off,
                len: loc.size,
                siod: None,
            }))
        }
        _ => {
            let Some(siod) = oiod.shard_iod(tgt) else {
                return Ok(None);
            };
            let sliced = iod.slice(siod.idx as usize, siod.nr as usize);
            let len = recxs_bytes(geo, &sliced.recxs, iod.size);
            Ok(Some(TargetIod {
                iod_idx,
                iod: sliced,
                off: siod.off,
                len,
                siod: Some(siod),
            }))
        }
    }
}

/// Split a reassembled request into per-target parts
#[instrument(skip(geo, iods, oiods), fields(targets = targets.len()))]
pub fn split_request(
    geo: &Geometry,
    iods: &[Iod],
    oiods: &[ObjectIod],
    targets: &[u32],
    leader: u32,
    update: bool,
) -> Result<SplitRequest> {
    if iods.len() != oiods.len() {
        return Err(Error::InvalidArgument(format!(
            "{} iods with {} object iods",
            iods.len(),
            oiods.len()
        )));
    }
    if !targets.contains(&leader) {
        return Err(Error::InvalidArgument(format!(
            "leader {} is not one of the targets",
            leader
        )));
    }

    let mut leader_oiod = None;
    let mut forwards = try_alloc(targets.len().saturating_sub(1), "forward targets")?;
    for &tgt in targets {
        let mut parts = try_alloc(iods.len(), "target iods")?;
        for (i, (iod, oiod)) in iods.iter().zip(oiods).enumerate() {
            if let Some(part) = target_iod(geo, i, iod, oiod, tgt, update)? {
                parts.push(part);
            }
        }
        let oiod = TargetOiod {
            tgt_idx: tgt,
            orig_tgt_idx: tgt,
            iods: parts,
        };
        if tgt == leader {
            leader_oiod = Some(oiod);
        } else {
            forwards.push(oiod);
        }
    }

    let leader = leader_oiod
        .ok_or_else(|| Error::Internal(format!("leader {} lost during split", leader)))?;
    debug!(
        "Split request: leader {} with {} forwards",
        leader.tgt_idx,
        forwards.len()
    );
    Ok(SplitRequest { leader, forwards })
}

// =============================================================================
// Tests
// =============================================================================
