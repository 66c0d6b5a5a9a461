//! Request Reassembler
//!
//! Turns a client's flat IODs into EC-aware ones: extents are broken on
//! cell boundaries and regrouped per target, full stripes of an update get
//! their parity computed, and partial stripes are replicated to the parity
//! targets. The reassembled IOD lists each target's extents contiguously,
//! in target order, with a matching reassembled buffer.
//!
//! ```text
//!  user iod:  [0 ........................ 80)        k=4, cell=16
//!              │ break on cells
//!              ▼
//!  tgt0: [0,16) [64,16)   tgt1: [16,16)   tgt2: [32,16)   tgt3: [48,16)
//!  tgt4: P[0,64) [64,16)  tgt5: P[0,64) [64,16)
//! ```

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument};

use super::codec::{ClassEntry, Codec};
use super::geometry::Geometry;
use super::iod::{Iod, ObjectIod, ShardIod, SingvPlacement};
use super::recx::{set_parity, Recx};
use super::sorter::SegmentSorter;
use super::translate::{break_recx, recx_cell_nr, tgt_of_idx};
use crate::error::{try_alloc, try_alloc_zeroed, Error, Result};

// =============================================================================
// Full Stripe Tracking
// =============================================================================

/// One user extent containing at least one full stripe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullStripeRecx {
    /// Index of the extent in the user IOD
    pub idx: u32,
    /// Number of full stripes in `recx`
    pub stripe_nr: u32,
    /// Byte offset of `recx` in the user buffer
    pub byte_off: u64,
    /// The full-stripe part of the extent
    pub recx: Recx,
}

/// Full-stripe extents of one IOD and the parity computed over them
#[derive(Debug, Clone)]
pub struct FullStripeRecxArray {
    k: u32,
    p: u32,
    pub recxs: Vec<FullStripeRecx>,
    pub stripe_total: u32,
    /// One buffer per parity target holding every stripe's parity cell
    pbufs: Vec<Bytes>,
}

/// Split an extent into its head, full-stripe body and tail
fn split_stripes(geo: &Geometry, recx: &Recx) -> (Option<Recx>, Option<Recx>, Option<Recx>) {
    let stripe = geo.stripe_rec_nr();
    let end = recx.end();
    let fs_start = recx.idx.div_ceil(stripe) * stripe;
    let fs_end = end / stripe * stripe;
    if fs_start >= fs_end {
        return (Some(*recx), None, None);
    }
    let head = (recx.idx < fs_start).then(|| Recx::new(recx.idx, fs_start - recx.idx));
    let tail = (fs_end < end).then(|| Recx::new(fs_end, end - fs_end));
    (head, Some(Recx::new(fs_start, fs_end - fs_start)), tail)
}

impl FullStripeRecxArray {
    /// Find the full stripes of an array IOD, `None` when there are none
    pub fn collect(geo: &Geometry, iod: &Iod) -> Result<Option<Self>> {
        let mut recxs = Vec::new();
        let mut stripe_total = 0u32;
        let mut off = 0u64;
        for (i, recx) in iod.recxs.iter().enumerate() {
            if let (_, Some(full), _) = split_stripes(geo, recx) {
                let stripe_nr = (full.nr / geo.stripe_rec_nr()) as u32;
                recxs.push(FullStripeRecx {
                    idx: i as u32,
                    stripe_nr,
                    byte_off: off + (full.idx - recx.idx) * iod.size,
                    recx: full,
                });
                stripe_total += stripe_nr;
            }
            off += recx.nr * iod.size;
        }
        if recxs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            k: geo.k(),
            p: geo.p(),
            recxs,
            stripe_total,
            pbufs: Vec::new(),
        }))
    }

    /// Compute parity for every full stripe of the user buffer
    pub fn encode(&mut self, geo: &Geometry, codec: &Codec, sgl: &[u8], rec_size: u64) -> Result<()> {
        let cell_bytes = geo.cell_bytes(rec_size) as usize;
        let stripe_bytes = geo.stripe_bytes(rec_size) as usize;
        let total = self.stripe_total as usize * cell_bytes;

        let mut pbufs = try_alloc(self.p as usize, "parity buffers")?;
        for _ in 0..self.p {
            pbufs.push(try_alloc_zeroed(total, "parity buffer")?);
        }

        let mut stripe_idx = 0usize;
        for fs in &self.recxs {
            for s in 0..fs.stripe_nr as usize {
                let base = fs.byte_off as usize + s * stripe_bytes;
                let stripe = sgl.get(base..base + stripe_bytes).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "buffer of {} bytes too short for stripe at {}",
                        sgl.len(),
                        base
                    ))
                })?;
                let data: Vec<&[u8]> = stripe.chunks(cell_bytes).collect();
                let pos = stripe_idx * cell_bytes;
                let mut parity: Vec<&mut [u8]> = pbufs
                    .iter_mut()
                    .map(|b| &mut b[pos..pos + cell_bytes])
                    .collect();
                codec.encode(&data, &mut parity)?;
                stripe_idx += 1;
            }
        }

        self.pbufs = pbufs.into_iter().map(Bytes::from).collect();
        debug!(
            "Encoded {} full stripes into {} parity cells each",
            self.stripe_total, self.p
        );
        Ok(())
    }

    /// Parity bytes of one full-stripe extent for parity target `p_idx`
    pub fn parity(&self, p_idx: u32, entry: usize) -> Result<Bytes> {
        let pbuf = self.pbufs.get(p_idx as usize).ok_or_else(|| {
            Error::Internal(format!("no parity buffer for parity target {}", p_idx))
        })?;
        let cell_bytes = pbuf.len() / self.stripe_total.max(1) as usize;
        let before: u32 = self.recxs[..entry].iter().map(|r| r.stripe_nr).sum();
        let nr = self.recxs[entry].stripe_nr as usize;
        let start = before as usize * cell_bytes;
        Ok(pbuf.slice(start..start + nr * cell_bytes))
    }

    pub fn data_tgt_nr(&self) -> u32 {
        self.k
    }

    pub fn parity_tgt_nr(&self) -> u32 {
        self.p
    }
}

// =============================================================================
// Reassembled Request
// =============================================================================

#[derive(Debug, Clone)]
enum FragSrc {
    /// Bytes at this offset of the user buffer
    User { off: u64 },
    /// Computed parity
    Parity(Bytes),
}

#[derive(Debug, Clone)]
struct Frag {
    recx: Recx,
    /// Index of the user extent this came from
    orig: usize,
    src: FragSrc,
}

/// Data-space extent of a reassembled IOD and where it lives in the user
/// buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub recx: Recx,
    pub user_off: u64,
}

/// Result of reassembling one request
#[derive(Debug, Clone)]
pub struct ReasbRequest {
    pub geometry: Geometry,
    pub update: bool,
    /// Reassembled IODs
    pub iods: Vec<Iod>,
    pub oiods: Vec<ObjectIod>,
    /// Reassembled buffers, empty for fetches
    pub sgls: Vec<Bytes>,
    pub fsrs: Vec<Option<FullStripeRecxArray>>,
    /// Bytes of user data per IOD
    pub user_bytes: Vec<u64>,
    user_offs: Vec<Vec<Option<u64>>>,
    tgts: Vec<u32>,
}

impl ReasbRequest {
    /// Logical targets involved, ascending
    pub fn targets(&self) -> &[u32] {
        &self.tgts
    }

    /// Data-space extents routed to a target, with their user offsets
    pub fn fragments(&self, iod_idx: usize, tgt: u32) -> Vec<Fragment> {
        let Some(siod) = self.oiods[iod_idx].shard_iod(tgt) else {
            return Vec::new();
        };
        let range = siod.idx as usize..(siod.idx + siod.nr) as usize;
        self.iods[iod_idx].recxs[range.clone()]
            .iter()
            .zip(&self.user_offs[iod_idx][range])
            .filter_map(|(recx, off)| {
                off.map(|user_off| Fragment {
                    recx: *recx,
                    user_off,
                })
            })
            .collect()
    }

    /// Copy one target's fetch reply for an IOD into the user buffer
    pub fn scatter_reply(&self, iod_idx: usize, tgt: u32, data: &[u8], out: &mut [u8]) -> Result<()> {
        let iod = &self.iods[iod_idx];
        match &self.oiods[iod_idx] {
            ObjectIod::Replica | ObjectIod::SingleValue(SingvPlacement::OneTarget { .. }) => {
                let n = data.len().min(out.len());
                out[..n].copy_from_slice(&data[..n]);
                Ok(())
            }
            ObjectIod::SingleValue(SingvPlacement::EvenDist { .. }) => {
                let loc = self.geometry.singv_local(iod.size, tgt, false)?;
                if !self.geometry.is_data_tgt(tgt) {
                    return Err(Error::InvalidArgument(format!(
                        "parity target {} replied to a single value fetch",
                        tgt
                    )));
                }
                let n = (loc.size as usize).min(data.len());
                let off = loc.off as usize;
                copy_into(out, off, &data[..n])
            }
            oiod => {
                let siod = oiod.shard_iod(tgt).ok_or_else(|| {
                    Error::InvalidArgument(format!("target {} not part of iod {}", tgt, iod.akey))
                })?;
                let mut pos = 0usize;
                for j in siod.idx as usize..(siod.idx + siod.nr) as usize {
                    let len = (iod.recxs[j].nr * iod.size) as usize;
                    let user_off = self.user_offs[iod_idx][j].ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "extent {} of iod {} has no user buffer",
                            iod.recxs[j], iod.akey
                        ))
                    })?;
                    let chunk = data.get(pos..pos + len).ok_or_else(|| {
                        Error::IoFailure {
                            tgt,
                            reason: format!("short reply, {} bytes", data.len()),
                        }
                    })?;
                    copy_into(out, user_off as usize, chunk)?;
                    pos += len;
                }
                if pos != data.len() {
                    return Err(Error::IoFailure {
                        tgt,
                        reason: format!("reply of {} bytes, expected {}", data.len(), pos),
                    });
                }
                Ok(())
            }
        }
    }
}

fn copy_into(out: &mut [u8], off: usize, data: &[u8]) -> Result<()> {
    let out_len = out.len();
    let dst = out.get_mut(off..off + data.len()).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "user buffer of {} bytes too short for {} bytes at {}",
            out_len,
            data.len(),
            off
        ))
    })?;
    dst.copy_from_slice(data);
    Ok(())
}

struct ReasbIod {
    iod: Iod,
    oiod: ObjectIod,
    sgl: Bytes,
    fsr: Option<FullStripeRecxArray>,
    user_offs: Vec<Option<u64>>,
}

// =============================================================================
// Reassembly
// =============================================================================

/// Reassemble a request for an EC object class
///
/// `sgls` holds one flat buffer per IOD for updates and is ignored for
/// fetches.
#[instrument(skip(class, iods, sgls), fields(class = %class.id, iod_nr = iods.len()))]
pub fn reassemble(class: &ClassEntry, iods: &[Iod], sgls: &[Bytes], update: bool) -> Result<ReasbRequest> {
    let geo = class.geometry;
    if update && sgls.len() != iods.len() {
        return Err(Error::InvalidArgument(format!(
            "{} buffers for {} iods",
            sgls.len(),
            iods.len()
        )));
    }

    let mut out = ReasbRequest {
        geometry: geo,
        update,
        iods: try_alloc(iods.len(), "reassembled iods")?,
        oiods: try_alloc(iods.len(), "object iods")?,
        sgls: try_alloc(iods.len(), "reassembled sgls")?,
        fsrs: try_alloc(iods.len(), "full stripe arrays")?,
        user_bytes: try_alloc(iods.len(), "user sizes")?,
        user_offs: try_alloc(iods.len(), "user offsets")?,
        tgts: Vec::new(),
    };

    for (i, iod) in iods.iter().enumerate() {
        iod.validate_ingress()?;
        let sgl = if update {
            let sgl = &sgls[i];
            if sgl.len() as u64 != iod.data_bytes() {
                return Err(Error::InvalidArgument(format!(
                    "iod {} covers {} bytes, buffer has {}",
                    iod.akey,
                    iod.data_bytes(),
                    sgl.len()
                )));
            }
            sgl.clone()
        } else {
            Bytes::new()
        };

        let reasb = if iod.is_single() {
            reasb_singv(&geo, &class.codec, iod, sgl, update)?
        } else {
            reasb_array(&geo, &class.codec, iod, sgl, update)?
        };

        out.user_bytes.push(iod.data_bytes());
        out.tgts.extend(reasb.oiod.targets());
        out.iods.push(reasb.iod);
        out.oiods.push(reasb.oiod);
        out.sgls.push(reasb.sgl);
        out.fsrs.push(reasb.fsr);
        out.user_offs.push(reasb.user_offs);
    }

    out.tgts.sort_unstable();
    out.tgts.dedup();
    debug!(
        "Reassembled {} iods over targets {:?}",
        out.iods.len(),
        out.tgts
    );
    Ok(out)
}

/// Data target shared by every extent, if there is exactly one
fn single_target(geo: &Geometry, iod: &Iod) -> Option<u32> {
    let mut tgt = None;
    for recx in &iod.recxs {
        if recx_cell_nr(geo, recx) != 1 {
            return None;
        }
        let t = tgt_of_idx(geo, recx.idx);
        match tgt {
            None => tgt = Some(t),
            Some(prev) if prev != t => return None,
            _ => {}
        }
    }
    tgt
}

fn reasb_array(geo: &Geometry, codec: &Codec, iod: &Iod, sgl: Bytes, update: bool) -> Result<ReasbIod> {
    let rec_size = iod.size;
    let p = if update { geo.p() } else { 0 };

    if p == 0 {
        if let Some(tgt) = single_target(geo, iod) {
            let mut user_offs = try_alloc(iod.recxs.len(), "user offsets")?;
            let mut off = 0;
            for recx in &iod.recxs {
                user_offs.push(Some(off));
                off += recx.nr * rec_size;
            }
            return Ok(ReasbIod {
                iod: iod.clone(),
                oiod: ObjectIod::Direct {
                    tgt_idx: tgt,
                    nr: iod.recxs.len() as u32,
                },
                sgl,
                fsr: None,
                user_offs,
            });
        }
    }

    let mut fsr = if p > 0 {
        FullStripeRecxArray::collect(geo, iod)?
    } else {
        None
    };
    if let Some(fsr) = fsr.as_mut() {
        fsr.encode(geo, codec, &sgl, rec_size)?;
    }

    let mut seg_total = 0usize;
    for recx in &iod.recxs {
        seg_total += recx_cell_nr(geo, recx) as usize;
        if p > 0 {
            let (head, full, tail) = split_stripes(geo, recx);
            let parts = head.is_some() as usize + full.is_some() as usize + tail.is_some() as usize;
            seg_total += parts * p as usize;
        }
    }

    let mut sorter = SegmentSorter::new(geo.tgt_nr() as usize, seg_total)?;
    let k = geo.k();
    let mut off = 0u64;
    let mut fs_entry = 0usize;
    for (ri, recx) in iod.recxs.iter().enumerate() {
        for piece in break_recx(geo, recx)? {
            sorter.insert(
                tgt_of_idx(geo, piece.idx),
                Frag {
                    recx: piece,
                    orig: ri,
                    src: FragSrc::User {
                        off: off + (piece.idx - recx.idx) * rec_size,
                    },
                },
            )?;
        }

        if p > 0 {
            let (head, full, tail) = split_stripes(geo, recx);
            for part in [head, tail].into_iter().flatten() {
                for j in 0..p {
                    sorter.insert(
                        k + j,
                        Frag {
                            recx: part,
                            orig: ri,
                            src: FragSrc::User {
                                off: off + (part.idx - recx.idx) * rec_size,
                            },
                        },
                    )?;
                }
            }
            if let Some(full) = full {
                let fsr = fsr.as_ref().ok_or_else(|| {
                    Error::Internal("full stripe without parity array".into())
                })?;
                let parity_recx = Recx::new(set_parity(full.idx)?, full.nr);
                for j in 0..p {
                    sorter.insert(
                        k + j,
                        Frag {
                            recx: parity_recx,
                            orig: ri,
                            src: FragSrc::Parity(fsr.parity(j, fs_entry)?),
                        },
                    )?;
                }
                fs_entry += 1;
            }
        }
        off += recx.nr * rec_size;
    }

    let buckets = sorter.finish()?;
    let mut recxs = try_alloc(seg_total, "reassembled recxs")?;
    let mut csums = match &iod.csums {
        Some(_) => Some(try_alloc(seg_total, "reassembled csums")?),
        None => None,
    };
    let mut user_offs = try_alloc(seg_total, "user offsets")?;
    let mut siods: Vec<ShardIod> = try_alloc(buckets.len(), "shard iods")?;
    let mut buf = if update {
        let total: u64 = iod.data_bytes() * (1 + p as u64);
        BytesMut::with_capacity(total as usize)
    } else {
        BytesMut::new()
    };

    let mut byte_off = 0u64;
    for (t, segs) in buckets.iter().enumerate() {
        if segs.is_empty() {
            continue;
        }
        siods.push(ShardIod {
            tgt_idx: t as u32,
            idx: recxs.len() as u32,
            off: byte_off,
            nr: segs.len() as u32,
        });
        for frag in segs {
            recxs.push(frag.recx);
            if let (Some(out), Some(orig)) = (csums.as_mut(), iod.csums.as_ref()) {
                out.push(match frag.src {
                    FragSrc::User { .. } => orig[frag.orig].clone(),
                    FragSrc::Parity(_) => Bytes::new(),
                });
            }
            match &frag.src {
                FragSrc::User { off } => {
                    let len = frag.recx.nr * rec_size;
                    if update {
                        buf.extend_from_slice(&sgl[*off as usize..(*off + len) as usize]);
                    }
                    user_offs.push(Some(*off));
                    byte_off += len;
                }
                FragSrc::Parity(bytes) => {
                    buf.extend_from_slice(bytes);
                    user_offs.push(None);
                    byte_off += bytes.len() as u64;
                }
            }
        }
    }

    let aligned = iod.recxs.iter().all(|r| {
        r.idx % geo.stripe_rec_nr() == 0 && r.nr % geo.stripe_rec_nr() == 0
    });
    let oiod = if aligned {
        let data_nr = aligned_stripe_nr(geo, iod)?;
        let oiod = ObjectIod::EvenDist {
            data_tgts: k,
            parity_tgts: p,
            data_nr,
            parity_nr: if p > 0 { iod.recxs.len() as u32 } else { 0 },
            tgt_bytes: u64::from(data_nr) * geo.cell_bytes(rec_size),
        };
        debug_assert_eq!(oiod.siods(), siods);
        oiod
    } else if siods.len() == 1 {
        ObjectIod::Direct {
            tgt_idx: siods[0].tgt_idx,
            nr: siods[0].nr,
        }
    } else {
        ObjectIod::Sharded(siods)
    };

    let mut reasb_iod = Iod::array(iod.akey.clone(), rec_size, recxs);
    reasb_iod.csums = csums;

    Ok(ReasbIod {
        iod: reasb_iod,
        oiod,
        sgl: buf.freeze(),
        fsr,
        user_offs,
    })
}

/// Stripes covered by stripe-aligned extents
fn aligned_stripe_nr(geo: &Geometry, iod: &Iod) -> Result<u32> {
    let stripes: u64 = iod.recxs.iter().map(|r| r.nr / geo.stripe_rec_nr()).sum();
    u32::try_from(stripes)
        .map_err(|_| Error::InvalidArgument(format!("iod {} spans {} stripes", iod.akey, stripes)))
}

fn reasb_singv(geo: &Geometry, codec: &Codec, iod: &Iod, sgl: Bytes, update: bool) -> Result<ReasbIod> {
    let gsize = iod.size;
    let p = if update { geo.p() } else { 0 };

    if geo.singv_one_tgt(gsize) {
        return Ok(ReasbIod {
            iod: iod.clone(),
            oiod: ObjectIod::SingleValue(SingvPlacement::OneTarget {
                tgt_idx: 0,
                replicas: (geo.k()..geo.k() + p).collect(),
            }),
            sgl,
            fsr: None,
            user_offs: Vec::new(),
        });
    }

    let sgl = if p > 0 {
        let cell = geo.singv_cell_bytes(gsize) as usize;
        let k = geo.k() as usize;
        let mut data = try_alloc_zeroed(k * cell, "single value cells")?;
        data[..gsize as usize].copy_from_slice(&sgl);
        let mut parity = try_alloc_zeroed(p as usize * cell, "single value parity")?;
        {
            let srcs: Vec<&[u8]> = data.chunks(cell).collect();
            let mut dsts: Vec<&mut [u8]> = parity.chunks_mut(cell).collect();
            codec.encode(&srcs, &mut dsts)?;
        }
        let mut buf = BytesMut::with_capacity(gsize as usize + parity.len());
        buf.extend_from_slice(&sgl);
        buf.extend_from_slice(&parity);
        buf.freeze()
    } else {
        sgl
    };

    Ok(ReasbIod {
        iod: iod.clone(),
        oiod: ObjectIod::SingleValue(SingvPlacement::EvenDist {
            tgt_nr: geo.k() + p,
        }),
        sgl,
        fsr: None,
        user_offs: Vec::new(),
    })
}

// =============================================================================
// Tests
// =============================================================================
