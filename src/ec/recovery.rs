//! Failure / Recovery Engine
//!
//! Tracks the targets that failed during one request and rebuilds the
//! missing data from the survivors.
//!
//! ```text
//!   Healthy ──insert_err──► PartialError ──record_parity_lists──► Reconciling
//!                               │                                     │
//!                               └───────────────prepare───────────────┤
//!                                                                     ▼
//!                                    Failed ◄──── errors > p ──── Recovering ──► Done
//! ```
//!
//! A [`FailInfo`] belongs to exactly one request attempt and is dropped with
//! it, so a retried fetch always starts from a clean state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::codec::Codec;
use super::geometry::Geometry;
use super::gf::{invert_matrix, GfTables};
use super::iod::{Iod, ObjectIod, SingvPlacement};
use super::reasb::Fragment;
use super::recx::{parity_lists_match, set_parity, Recx, RecxEpList};
use super::translate::{break_recx, shadow_list_to_logical, tgt_of_idx};
use crate::error::{try_alloc_zeroed, Error, Result};

/// State of a request's recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// No failed target
    Healthy,
    /// Failed targets recorded, nothing rebuilt yet
    PartialError,
    /// Recovery tasks prepared and running
    Recovering,
    /// Comparing parity reports of several targets
    Reconciling,
    /// Missing data rebuilt into the user buffers
    Done,
    Failed,
}

// =============================================================================
// Recovery Codec
// =============================================================================

/// Decode tables for one set of failed targets
#[derive(Debug, Clone)]
pub struct RecoveryCodec {
    err_list: Vec<u32>,
    in_err: Vec<bool>,
    /// Surviving targets used as decode sources, `k` of them
    dec_idx: Vec<u32>,
    /// Failed data targets, in the order of the decode table rows
    data_err: Vec<u32>,
    tables: GfTables,
}

impl RecoveryCodec {
    /// Build decode tables for the given failed targets
    pub fn build(geo: &Geometry, codec: &Codec, err_tgts: &[u32]) -> Result<Self> {
        let k = geo.k() as usize;
        let tgt_nr = geo.tgt_nr() as usize;
        if err_tgts.len() > geo.p() as usize {
            return Err(Error::InsufficientShards {
                available: tgt_nr - err_tgts.len(),
                required: k,
            });
        }

        let mut in_err = vec![false; tgt_nr];
        for &t in err_tgts {
            let slot = in_err.get_mut(t as usize).ok_or_else(|| {
                Error::InvalidArgument(format!("failed target {} out of range", t))
            })?;
            *slot = true;
        }

        let dec_idx: Vec<u32> = (0..tgt_nr as u32)
            .filter(|&t| !in_err[t as usize])
            .take(k)
            .collect();
        if dec_idx.len() < k {
            return Err(Error::InsufficientShards {
                available: dec_idx.len(),
                required: k,
            });
        }

        let mut sub = Vec::with_capacity(k * k);
        for &t in &dec_idx {
            sub.extend_from_slice(codec.matrix_row(t as usize));
        }
        let inv = invert_matrix(&sub, k)?;

        let data_err: Vec<u32> = err_tgts.iter().copied().filter(|&t| (t as usize) < k).collect();
        let mut coefs = Vec::with_capacity(data_err.len() * k);
        for &e in &data_err {
            coefs.extend_from_slice(&inv[e as usize * k..(e as usize + 1) * k]);
        }
        let tables = GfTables::expand(&coefs, data_err.len(), k)?;

        debug!(
            "Recovery codec: errors {:?}, sources {:?}",
            err_tgts, dec_idx
        );
        Ok(Self {
            err_list: err_tgts.to_vec(),
            in_err,
            dec_idx,
            data_err,
            tables,
        })
    }

    pub fn err_list(&self) -> &[u32] {
        &self.err_list
    }

    pub fn nerrs(&self) -> usize {
        self.err_list.len()
    }

    pub fn data_nerrs(&self) -> usize {
        self.data_err.len()
    }

    pub fn dec_idx(&self) -> &[u32] {
        &self.dec_idx
    }

    pub fn is_err(&self, tgt: u32) -> bool {
        self.in_err.get(tgt as usize).copied().unwrap_or(false)
    }

    /// Rebuild the failed data cells of one stripe in place
    ///
    /// `stripe` holds `k + p` cells of `cell_bytes` each, in logical target
    /// order, with the source cells filled in.
    pub fn recover(&self, stripe: &mut [u8], cell_bytes: usize) -> Result<()> {
        if self.data_err.is_empty() {
            return Ok(());
        }
        let mut cells: Vec<Option<&mut [u8]>> = stripe.chunks_mut(cell_bytes).map(Some).collect();
        let mut dsts = Vec::with_capacity(self.data_err.len());
        for &e in &self.data_err {
            let cell = cells
                .get_mut(e as usize)
                .and_then(Option::take)
                .ok_or_else(|| Error::Internal(format!("no cell for target {}", e)))?;
            dsts.push(cell);
        }
        let srcs = self
            .dec_idx
            .iter()
            .map(|&i| {
                cells
                    .get(i as usize)
                    .and_then(|c| c.as_deref())
                    .ok_or_else(|| Error::Internal(format!("no cell for target {}", i)))
            })
            .collect::<Result<Vec<&[u8]>>>()?;
        self.tables.vector_multiply(cell_bytes, &srcs, &mut dsts)
    }
}

// =============================================================================
// Recovery Tasks
// =============================================================================

/// What a recovery task rebuilds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryRange {
    /// Whole stripes of an array, logical and stripe aligned
    Stripes(Recx),
    /// An evenly distributed single value of `gsize` bytes
    Single { gsize: u64 },
}

/// One read-and-decode unit
#[derive(Debug, Clone)]
pub struct RecoveryTask {
    pub iod_idx: usize,
    pub akey: String,
    pub range: RecoveryRange,
    /// Epoch the sources are read at
    pub epoch: u64,
    pub rec_size: u64,
    /// `stripe_nr * (k + p)` cells, stripe by stripe
    pub buf: Vec<u8>,
}

impl RecoveryTask {
    fn new(geo: &Geometry, iod_idx: usize, akey: &str, range: RecoveryRange, epoch: u64, rec_size: u64) -> Result<Self> {
        let mut task = Self {
            iod_idx,
            akey: akey.to_string(),
            range,
            epoch,
            rec_size,
            buf: Vec::new(),
        };
        let len = task.stripe_nr(geo) * task.stripe_bytes(geo);
        task.buf = try_alloc_zeroed(len as usize, "recovery buffer")?;
        Ok(task)
    }

    pub fn stripe_nr(&self, geo: &Geometry) -> u64 {
        match self.range {
            RecoveryRange::Stripes(recx) => recx.nr / geo.stripe_rec_nr(),
            RecoveryRange::Single { .. } => 1,
        }
    }

    pub fn cell_bytes(&self, geo: &Geometry) -> u64 {
        match self.range {
            RecoveryRange::Stripes(_) => geo.cell_bytes(self.rec_size),
            RecoveryRange::Single { gsize } => geo.singv_cell_bytes(gsize),
        }
    }

    /// Bytes one stripe occupies in the task buffer, parity included
    pub fn stripe_bytes(&self, geo: &Geometry) -> u64 {
        self.cell_bytes(geo) * geo.tgt_nr() as u64
    }

    /// Read to issue to a source target
    pub fn source_iod(&self, geo: &Geometry, tgt: u32) -> Result<Iod> {
        match self.range {
            RecoveryRange::Single { gsize } => Ok(Iod::single(self.akey.clone(), gsize)),
            RecoveryRange::Stripes(recx) if geo.is_data_tgt(tgt) => {
                let cell = geo.cell_rec_nr();
                let recxs = (0..self.stripe_nr(geo))
                    .map(|s| Recx::new(recx.idx + s * geo.stripe_rec_nr() + tgt as u64 * cell, cell))
                    .collect();
                Ok(Iod::array(self.akey.clone(), self.rec_size, recxs))
            }
            RecoveryRange::Stripes(recx) => Ok(Iod::array(
                self.akey.clone(),
                self.rec_size,
                vec![Recx::new(set_parity(recx.idx)?, recx.nr)],
            )),
        }
    }

    /// Place a source target's reply into the task buffer
    pub fn fill_target(&mut self, geo: &Geometry, tgt: u32, data: &[u8]) -> Result<()> {
        let cb = self.cell_bytes(geo) as usize;
        let sb = self.stripe_bytes(geo) as usize;
        let stripes = self.stripe_nr(geo) as usize;
        let expected = match self.range {
            RecoveryRange::Single { gsize } if geo.is_data_tgt(tgt) => {
                geo.singv_local(gsize, tgt, false)?.size as usize
            }
            _ => stripes * cb,
        };
        if data.len() != expected {
            return Err(Error::IoFailure {
                tgt,
                reason: format!("recovery read of {} bytes, expected {}", data.len(), expected),
            });
        }
        for (s, chunk) in data.chunks(cb).enumerate() {
            let off = s * sb + tgt as usize * cb;
            self.buf[off..off + chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Copy rebuilt records of a logical extent into a user buffer
    pub fn copy_out(&self, geo: &Geometry, recx: &Recx, out: &mut [u8]) -> Result<()> {
        match self.range {
            RecoveryRange::Single { gsize } => {
                let n = (gsize as usize).min(out.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                Ok(())
            }
            RecoveryRange::Stripes(range) => {
                if !range.covers(recx) {
                    return Err(Error::InvalidArgument(format!(
                        "extent {} outside recovered range {}",
                        recx, range
                    )));
                }
                let cb = self.cell_bytes(geo);
                let sb = self.stripe_bytes(geo);
                let mut pos = 0usize;
                for piece in break_recx(geo, recx)? {
                    let s = (piece.idx - range.idx) / geo.stripe_rec_nr();
                    let tgt = tgt_of_idx(geo, piece.idx) as u64;
                    let within = piece.idx % geo.cell_rec_nr();
                    let src = (s * sb + tgt * cb + within * self.rec_size) as usize;
                    let len = (piece.nr * self.rec_size) as usize;
                    let dst = out.get_mut(pos..pos + len).ok_or_else(|| {
                        Error::InvalidArgument("user buffer too short for recovered data".into())
                    })?;
                    dst.copy_from_slice(&self.buf[src..src + len]);
                    pos += len;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Fail Info
// =============================================================================

/// Missing data that no parity covers and must be read from a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    Array { iod_idx: usize, frag: Fragment },
    Single { iod_idx: usize },
}

/// Per-request failure state
#[derive(Debug)]
pub struct FailInfo {
    geometry: Geometry,
    codec: Arc<Codec>,
    state: RecoveryState,
    err_tgts: Vec<u32>,
    missing: Vec<Vec<Fragment>>,
    missing_singv: Vec<bool>,
    stripe_lists: Option<Vec<RecxEpList>>,
    /// Partial-stripe replicas held by the parity targets, logical indices
    replica_lists: Option<Vec<RecxEpList>>,
    /// Missing fragments assigned to recovery tasks
    covered: Vec<(usize, Fragment)>,
    recov_codec: Option<RecoveryCodec>,
    tasks: Vec<RecoveryTask>,
}

impl FailInfo {
    pub fn new(geometry: Geometry, codec: Arc<Codec>, iod_nr: usize) -> Self {
        Self {
            geometry,
            codec,
            state: RecoveryState::Healthy,
            err_tgts: Vec::new(),
            missing: vec![Vec::new(); iod_nr],
            missing_singv: vec![false; iod_nr],
            stripe_lists: None,
            replica_lists: None,
            covered: Vec::new(),
            recov_codec: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn err_tgts(&self) -> &[u32] {
        &self.err_tgts
    }

    pub fn is_err(&self, tgt: u32) -> bool {
        self.err_tgts.contains(&tgt)
    }

    /// Record a failed target
    ///
    /// More failures than parity targets cannot be recovered; the request
    /// fails at once.
    pub fn insert_err(&mut self, tgt: u32) -> Result<()> {
        if tgt >= self.geometry.tgt_nr() {
            return Err(Error::InvalidArgument(format!(
                "failed target {} out of range",
                tgt
            )));
        }
        if self.err_tgts.contains(&tgt) {
            return Ok(());
        }
        self.err_tgts.push(tgt);
        self.recov_codec = None;

        if self.err_tgts.len() > self.geometry.p() as usize {
            self.state = RecoveryState::Failed;
            return Err(Error::DataLoss(format!(
                "{} failed targets {:?} exceed {} parity",
                self.err_tgts.len(),
                self.err_tgts,
                self.geometry.p()
            )));
        }
        warn!("Target {} failed, {} in error", tgt, self.err_tgts.len());
        self.state = RecoveryState::PartialError;
        Ok(())
    }

    pub fn add_missing(&mut self, iod_idx: usize, frag: Fragment) {
        self.missing[iod_idx].push(frag);
    }

    pub fn add_missing_singv(&mut self, iod_idx: usize) {
        self.missing_singv[iod_idx] = true;
    }

    pub fn missing(&self, iod_idx: usize) -> &[Fragment] {
        &self.missing[iod_idx]
    }

    /// Record one parity target's shadow lists, one list per IOD
    ///
    /// Lists are translated to logical stripe ranges. Every report after the
    /// first must agree with the first.
    pub fn record_parity_lists(&mut self, mut lists: Vec<RecxEpList>) -> Result<()> {
        shadow_list_to_logical(&self.geometry, &mut lists)?;
        match &self.stripe_lists {
            None => {
                self.stripe_lists = Some(lists);
                Ok(())
            }
            Some(existing) => {
                self.state = RecoveryState::Reconciling;
                if let Err(e) = parity_lists_match(existing, &lists) {
                    self.state = RecoveryState::Failed;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Record one parity target's replica lists, one list per IOD
    ///
    /// Replicas newer than the parity covering them take precedence over
    /// rebuilt data. Every report after the first must agree with the first.
    pub fn record_replica_lists(&mut self, lists: Vec<RecxEpList>) -> Result<()> {
        match &self.replica_lists {
            None => {
                self.replica_lists = Some(lists);
                Ok(())
            }
            Some(existing) => {
                if let Err(e) = parity_lists_match(existing, &lists) {
                    self.state = RecoveryState::Failed;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Lazily built decode tables for the current failed set
    pub fn recovery_codec(&mut self) -> Result<&RecoveryCodec> {
        if self.recov_codec.is_none() {
            self.recov_codec = Some(RecoveryCodec::build(
                &self.geometry,
                &self.codec,
                &self.err_tgts,
            )?);
        }
        self.recov_codec
            .as_ref()
            .ok_or_else(|| Error::Internal("recovery codec missing".into()))
    }

    /// Turn the missing data into recovery tasks
    ///
    /// Returns the pieces no parity covers, which the caller reads from a
    /// surviving replica instead.
    #[instrument(skip(self, iods, oiods), fields(errs = ?self.err_tgts))]
    pub fn prepare(&mut self, iods: &[Iod], oiods: &[ObjectIod], epoch: u64) -> Result<Vec<Redirect>> {
        if self.err_tgts.len() > self.geometry.p() as usize {
            self.state = RecoveryState::Failed;
            return Err(Error::DataLoss("too many failed targets".into()));
        }
        self.state = RecoveryState::Recovering;
        let geo = self.geometry;
        let mut redirects = Vec::new();

        for (i, iod) in iods.iter().enumerate() {
            if iod.is_single() {
                if !self.missing_singv[i] {
                    continue;
                }
                match &oiods[i] {
                    ObjectIod::SingleValue(SingvPlacement::EvenDist { .. }) => {
                        let task = RecoveryTask::new(
                            &geo,
                            i,
                            &iod.akey,
                            RecoveryRange::Single { gsize: iod.size },
                            epoch,
                            1,
                        )?;
                        self.tasks.push(task);
                    }
                    _ => redirects.push(Redirect::Single { iod_idx: i }),
                }
                continue;
            }

            let items = self
                .stripe_lists
                .as_ref()
                .and_then(|l| l.get(i))
                .map(|l| l.items.clone())
                .unwrap_or_default();

            let replicas = self
                .replica_lists
                .as_ref()
                .and_then(|l| l.get(i))
                .map(|l| l.items.clone())
                .unwrap_or_default();

            let mut hits: Vec<Option<(u64, u64)>> = vec![None; items.len()];
            for frag in &self.missing[i] {
                // replicas written after the parity that covers them
                let mut newer = Vec::new();
                for item in &items {
                    let Some(in_parity) = item.recx.intersect(&frag.recx) else {
                        continue;
                    };
                    for rep in replicas.iter().filter(|r| r.epoch > item.epoch) {
                        if let Some(hit) = rep.recx.intersect(&in_parity) {
                            newer.push(hit);
                        }
                    }
                }

                let mut gaps = vec![frag.recx];
                for (j, item) in items.iter().enumerate() {
                    let Some(hit) = item.recx.intersect(&frag.recx) else {
                        continue;
                    };
                    gaps = gaps.iter().flat_map(|g| subtract(g, &item.recx)).collect();
                    let mut pieces = vec![hit];
                    for n in &newer {
                        pieces = pieces.iter().flat_map(|p| subtract(p, n)).collect();
                    }
                    for piece in pieces {
                        self.covered.push((
                            i,
                            Fragment {
                                recx: piece,
                                user_off: frag.user_off + (piece.idx - frag.recx.idx) * iod.size,
                            },
                        ));
                        hits[j] = Some(match hits[j] {
                            None => (piece.idx, piece.end()),
                            Some((s, e)) => (s.min(piece.idx), e.max(piece.end())),
                        });
                    }
                }
                if !newer.is_empty() {
                    debug!("Replicas newer than parity for {:?} of {}", newer, iod.akey);
                }
                for gap in gaps.into_iter().chain(newer) {
                    redirects.push(Redirect::Array {
                        iod_idx: i,
                        frag: Fragment {
                            recx: gap,
                            user_off: frag.user_off + (gap.idx - frag.recx.idx) * iod.size,
                        },
                    });
                }
            }

            let stripe = geo.stripe_rec_nr();
            for (item, hit) in items.iter().zip(hits) {
                let Some((s, e)) = hit else { continue };
                let start = s / stripe * stripe;
                let end = e.div_ceil(stripe) * stripe;
                let task = RecoveryTask::new(
                    &geo,
                    i,
                    &iod.akey,
                    RecoveryRange::Stripes(Recx::new(start, end - start)),
                    item.epoch,
                    item.rec_size,
                )?;
                self.tasks.push(task);
            }
        }

        debug!(
            "Prepared {} recovery tasks, {} redirects",
            self.tasks.len(),
            redirects.len()
        );
        Ok(redirects)
    }

    pub fn tasks(&self) -> &[RecoveryTask] {
        &self.tasks
    }

    /// Move the prepared tasks out for execution
    pub fn take_tasks(&mut self) -> Vec<RecoveryTask> {
        std::mem::take(&mut self.tasks)
    }

    /// Decode every stripe of a task whose sources are filled in
    pub fn decode_task(&mut self, task: &mut RecoveryTask) -> Result<()> {
        let geo = self.geometry;
        let cb = task.cell_bytes(&geo) as usize;
        let sb = task.stripe_bytes(&geo) as usize;
        let codec = self.recovery_codec()?;
        for stripe in task.buf.chunks_mut(sb) {
            codec.recover(stripe, cb)?;
        }
        Ok(())
    }

    /// Copy a decoded task's data into the user buffer of its IOD
    pub fn copy_recovered(&self, task: &RecoveryTask, out: &mut [u8]) -> Result<()> {
        match task.range {
            RecoveryRange::Single { .. } => task.copy_out(&self.geometry, &Recx::default(), out),
            RecoveryRange::Stripes(range) => {
                for (i, frag) in &self.covered {
                    if *i != task.iod_idx || !range.covers(&frag.recx) {
                        continue;
                    }
                    let start = frag.user_off as usize;
                    let len = (frag.recx.nr * task.rec_size) as usize;
                    let dst = out.get_mut(start..start + len).ok_or_else(|| {
                        Error::InvalidArgument("user buffer too short for recovered data".into())
                    })?;
                    task.copy_out(&self.geometry, &frag.recx, dst)?;
                }
                Ok(())
            }
        }
    }

    pub fn finish(&mut self) {
        self.state = RecoveryState::Done;
    }

    /// Mark the request failed and hand the error back
    pub fn fail(&mut self, err: Error) -> Error {
        self.state = RecoveryState::Failed;
        err
    }
}

/// Parts of `a` outside `b`
fn subtract(a: &Recx, b: &Recx) -> Vec<Recx> {
    if !a.overlaps(b) {
        return vec![*a];
    }
    let mut out = Vec::with_capacity(2);
    if a.idx < b.idx {
        out.push(Recx::new(a.idx, b.idx - a.idx));
    }
    if b.end() < a.end() {
        out.push(Recx::new(b.end(), a.end() - b.end()));
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
