//! EC Object I/O
//!
//! Drives updates and fetches of one object class over a [`ShardTransport`].
//! The object plays the leader: it reassembles the request, splits it per
//! target and dispatches every part concurrently.
//!
//! ```text
//!  fetch ──► data targets ──ok──────────────────────────────► user buffers
//!                 │                                                ▲
//!                 └─fail──► FailInfo ──► parity lists ──► tasks ───┤
//!                                                   └──► redirects ┘
//! ```
//!
//! Rebuilt stripes are read at the epoch their parity was written at. Data
//! overwritten after that parity is read from the partial-stripe replica on
//! a parity target instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::transport::{ShardReply, ShardRequest, ShardTransport};
use crate::config::IoConfig;
use crate::ec::codec::ClassEntry;
use crate::ec::geometry::Geometry;
use crate::ec::iod::Iod;
use crate::ec::reasb::{reassemble, ReasbRequest};
use crate::ec::recovery::{FailInfo, RecoveryTask, Redirect};
use crate::ec::recx::SpacedRecx;
use crate::ec::split::{leader_tgt, split_request, TargetIod, TargetOiod};
use crate::ec::translate::{tgt_of_idx, TargetRotation};
use crate::error::{try_alloc, try_alloc_zeroed, Error, ErrorKind, Result};
use crate::metrics::EcMetrics;

#[derive(Debug, Clone, Copy)]
enum ShardOp {
    Update,
    Fetch,
}

impl ShardOp {
    fn as_str(&self) -> &'static str {
        match self {
            ShardOp::Update => "update",
            ShardOp::Fetch => "fetch",
        }
    }
}

/// Outcome of a failed recovery attempt
enum TaskError {
    /// A source target failed; recovery can go on without it
    Source { tgt: u32, err: Error },
    Fatal(Error),
}

/// Hash of a distribution key, selects the target rotation
pub fn dkey_hash(dkey: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    dkey.bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

/// An erasure-coded object
pub struct EcObject {
    class: ClassEntry,
    transport: Arc<dyn ShardTransport>,
    io: IoConfig,
    metrics: EcMetrics,
    epoch: AtomicU64,
}

impl EcObject {
    pub fn new(
        class: ClassEntry,
        transport: Arc<dyn ShardTransport>,
        io: IoConfig,
        metrics: EcMetrics,
    ) -> Self {
        Self {
            class,
            transport,
            io,
            metrics,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn class(&self) -> &ClassEntry {
        &self.class
    }

    pub fn geometry(&self) -> Geometry {
        self.class.geometry
    }

    pub fn metrics(&self) -> &EcMetrics {
        &self.metrics
    }

    /// Epoch of the latest update
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Rotation of the group holding a dkey
    pub fn rotation(&self, dkey: &str) -> TargetRotation {
        TargetRotation::new(&self.class.geometry, self.io.layout_version, dkey_hash(dkey))
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn send(&self, op: ShardOp, req: ShardRequest) -> Result<ShardReply> {
        let tgt = req.tgt_off;
        let shard = req.shard;
        let fut = match op {
            ShardOp::Update => self.transport.update(req),
            ShardOp::Fetch => self.transport.fetch(req),
        };
        let counter = |outcome: &str| {
            self.metrics
                .shard_ops
                .with_label_values(&[op.as_str(), outcome])
                .inc()
        };
        match timeout(self.io.shard_timeout, fut).await {
            Ok(Ok(reply)) => {
                counter("ok");
                Ok(reply)
            }
            Ok(Err(e)) => {
                counter("error");
                warn!("{} on target {} (shard {}) failed: {}", op.as_str(), tgt, shard, e);
                Err(e)
            }
            Err(_) => {
                counter("timeout");
                warn!("{} on target {} (shard {}) timed out", op.as_str(), tgt, shard);
                Err(Error::Timeout(format!(
                    "target {} did not answer within {:?}",
                    tgt, self.io.shard_timeout
                )))
            }
        }
    }

    fn shard_request(&self, rot: &TargetRotation, toiod: &TargetOiod, dkey: &str, epoch: u64) -> ShardRequest {
        ShardRequest::new(
            rot.shard_idx(toiod.tgt_idx),
            toiod.tgt_idx,
            self.class.geometry,
            dkey,
            epoch,
        )
        .with_iods(toiod.target_iods())
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Write the IODs, one flat buffer each, and return the update epoch
    #[instrument(skip(self, iods, sgls), fields(class = %self.class.name, iod_nr = iods.len()))]
    pub async fn update(&self, dkey: &str, iods: &[Iod], sgls: &[Bytes]) -> Result<u64> {
        self.metrics.requests.with_label_values(&["update"]).inc();
        let geo = self.class.geometry;
        let req = reassemble(&self.class, iods, sgls, true)?;
        let leader = leader_tgt(&geo, req.targets())
            .ok_or_else(|| Error::InvalidArgument("update addresses no target".into()))?;
        let split = split_request(&geo, &req.iods, &req.oiods, req.targets(), leader, true)?;

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let rot = self.rotation(dkey);
        let mut sends = try_alloc(split.forwards.len() + 1, "update requests")?;
        for toiod in split.all() {
            let shard_req = self
                .shard_request(&rot, toiod, dkey, epoch)
                .with_data(toiod.extract_data(&req.sgls)?);
            sends.push(self.send(ShardOp::Update, shard_req));
        }

        let results = join_all(sends).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            warn!("Update at epoch {} failed on {} targets", epoch, failed);
            return Err(err);
        }
        debug!(
            "Updated {} targets at epoch {}, leader {}",
            req.targets().len(),
            epoch,
            leader
        );
        Ok(epoch)
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    /// Read the IODs at the latest epoch
    ///
    /// Single values must carry their full size.
    pub async fn fetch(&self, dkey: &str, iods: &[Iod]) -> Result<Vec<Bytes>> {
        self.fetch_at(dkey, iods, self.epoch()).await
    }

    /// Fetch, re-issuing while a concurrent write is detected
    pub async fn fetch_with_retry(&self, dkey: &str, iods: &[Iod]) -> Result<Vec<Bytes>> {
        let mut attempt = 0;
        loop {
            match self.fetch(dkey, iods).await {
                Err(e) if e.is_retryable() && attempt < self.io.max_fetch_retries => {
                    attempt += 1;
                    self.metrics.fetch_again.inc();
                    warn!("Fetch raced an update ({}), attempt {}", e, attempt);
                    if !self.io.fetch_retry_backoff.is_zero() {
                        tokio::time::sleep(self.io.fetch_retry_backoff).await;
                    }
                }
                other => return other,
            }
        }
    }

    /// Read the IODs as of `epoch`
    #[instrument(skip(self, iods), fields(class = %self.class.name, iod_nr = iods.len()))]
    pub async fn fetch_at(&self, dkey: &str, iods: &[Iod], epoch: u64) -> Result<Vec<Bytes>> {
        self.metrics.requests.with_label_values(&["fetch"]).inc();
        let result = self.fetch_inner(dkey, iods, epoch).await;
        if let Err(e) = &result {
            if e.kind() == ErrorKind::DataLoss {
                self.metrics.data_loss.inc();
            }
        }
        result
    }

    async fn fetch_inner(&self, dkey: &str, iods: &[Iod], epoch: u64) -> Result<Vec<Bytes>> {
        let geo = self.class.geometry;
        let req = reassemble(&self.class, iods, &[], false)?;
        let leader = leader_tgt(&geo, req.targets())
            .ok_or_else(|| Error::InvalidArgument("fetch addresses no target".into()))?;
        let split = split_request(&geo, &req.iods, &req.oiods, req.targets(), leader, false)?;
        let rot = self.rotation(dkey);

        let mut out = try_alloc(iods.len(), "user buffers")?;
        for bytes in &req.user_bytes {
            out.push(try_alloc_zeroed(*bytes as usize, "user buffer")?);
        }

        let toiods = split.into_all();
        let sends = toiods
            .iter()
            .map(|t| self.send(ShardOp::Fetch, self.shard_request(&rot, t, dkey, epoch)));
        let replies = join_all(sends).await;

        let mut fail = FailInfo::new(geo, self.class.codec.clone(), iods.len());
        for (toiod, reply) in toiods.iter().zip(replies) {
            match reply {
                Ok(reply) => self.scatter(&req, toiod, &reply, &mut out)?,
                Err(e) if e.kind() == ErrorKind::IoFailure => {
                    fail.insert_err(toiod.tgt_idx)?;
                    for part in &toiod.iods {
                        if part.iod.is_single() {
                            fail.add_missing_singv(part.iod_idx);
                        } else {
                            for frag in req.fragments(part.iod_idx, toiod.tgt_idx) {
                                fail.add_missing(part.iod_idx, frag);
                            }
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if !fail.err_tgts().is_empty() {
            self.metrics.degraded_fetches.inc();
            info!(
                "Degraded fetch at epoch {}, failed targets {:?}",
                epoch,
                fail.err_tgts()
            );
            if let Err(e) = self.recover(dkey, &req, &mut fail, epoch, &mut out).await {
                return Err(fail.fail(e));
            }
            fail.finish();
        }

        Ok(out.into_iter().map(Bytes::from).collect())
    }

    fn scatter(&self, req: &ReasbRequest, toiod: &TargetOiod, reply: &ShardReply, out: &mut [Vec<u8>]) -> Result<()> {
        for (j, part) in toiod.iods.iter().enumerate() {
            let data = reply.data.get(j).ok_or_else(|| Error::IoFailure {
                tgt: toiod.tgt_idx,
                reason: format!("reply has {} buffers, expected {}", reply.data.len(), toiod.iods.len()),
            })?;
            if part.iod.is_single() {
                let stored = reply.sizes.get(j).copied().unwrap_or(0);
                if stored != 0 && stored != part.iod.size {
                    return Err(Error::InvalidArgument(format!(
                        "single value {} is {} bytes, fetched as {}",
                        part.iod.akey, stored, part.iod.size
                    )));
                }
            }
            req.scatter_reply(part.iod_idx, toiod.tgt_idx, data, &mut out[part.iod_idx])?;
        }
        Ok(())
    }

    // =========================================================================
    // Degraded Fetch
    // =========================================================================

    async fn recover(
        &self,
        dkey: &str,
        req: &ReasbRequest,
        fail: &mut FailInfo,
        epoch: u64,
        out: &mut [Vec<u8>],
    ) -> Result<()> {
        let rot = self.rotation(dkey);

        if (0..req.iods.len()).any(|i| !fail.missing(i).is_empty()) {
            self.query_parity(dkey, req, fail, epoch, &rot).await?;
        }

        let redirects = fail.prepare(&req.iods, &req.oiods, epoch)?;
        let mut tasks = fail.take_tasks();

        if !tasks.is_empty() {
            loop {
                let sources = fail.recovery_codec()?.dec_idx().to_vec();
                match self.run_tasks(dkey, &rot, &mut tasks, &sources).await {
                    Ok(()) => break,
                    Err(TaskError::Source { tgt, err }) => {
                        warn!("Recovery source target {} failed: {}", tgt, err);
                        fail.insert_err(tgt)?;
                    }
                    Err(TaskError::Fatal(err)) => return Err(err),
                }
            }
            for task in tasks.iter_mut() {
                fail.decode_task(task)?;
                fail.copy_recovered(task, &mut out[task.iod_idx])?;
                self.metrics.recovery_tasks.inc();
            }
        }

        for redirect in redirects {
            self.read_redirect(dkey, &rot, req, fail, redirect, epoch, out)
                .await?;
        }
        debug!("Recovered fetch, failed targets {:?}", fail.err_tgts());
        Ok(())
    }

    /// Collect and reconcile the parity and replica lists of the surviving
    /// parity targets
    async fn query_parity(
        &self,
        dkey: &str,
        req: &ReasbRequest,
        fail: &mut FailInfo,
        epoch: u64,
        rot: &TargetRotation,
    ) -> Result<()> {
        let geo = self.class.geometry;
        let query_iods: Vec<Iod> = req
            .iods
            .iter()
            .map(|iod| Iod {
                recxs: Vec::new(),
                csums: None,
                ..iod.clone()
            })
            .collect();

        let parity_tgts: Vec<u32> = (geo.k()..geo.tgt_nr()).filter(|&t| !fail.is_err(t)).collect();
        let sends = parity_tgts.iter().map(|&t| {
            let req = ShardRequest::new(rot.shard_idx(t), t, geo, dkey, epoch)
                .with_iods(query_iods.clone())
                .with_parity_query();
            self.send(ShardOp::Fetch, req)
        });
        let replies = join_all(sends).await;

        for (&t, reply) in parity_tgts.iter().zip(replies) {
            match reply {
                Ok(reply) => {
                    let lists = reply.parity_lists.ok_or_else(|| Error::IoFailure {
                        tgt: t,
                        reason: "no parity lists in reply".into(),
                    })?;
                    fail.record_parity_lists(lists)?;
                    let replicas = reply.replica_lists.ok_or_else(|| Error::IoFailure {
                        tgt: t,
                        reason: "no replica lists in reply".into(),
                    })?;
                    fail.record_replica_lists(replicas)?;
                }
                Err(e) if e.kind() == ErrorKind::IoFailure => fail.insert_err(t)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn run_tasks(
        &self,
        dkey: &str,
        rot: &TargetRotation,
        tasks: &mut [RecoveryTask],
        sources: &[u32],
    ) -> std::result::Result<(), TaskError> {
        let sem = Semaphore::new(self.io.max_concurrent_recovery);
        let token = CancellationToken::new();
        let runs = tasks.iter_mut().map(|task| {
            let sem = &sem;
            let token = &token;
            async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| TaskError::Fatal(Error::Cancelled))?;
                let res = tokio::select! {
                    _ = token.cancelled() => Err(TaskError::Fatal(Error::Cancelled)),
                    res = self.read_sources(dkey, rot, task, sources) => res,
                };
                if res.is_err() {
                    token.cancel();
                }
                res
            }
        });

        let mut first_err = None;
        for res in join_all(runs).await {
            match res {
                Ok(()) => {}
                Err(TaskError::Fatal(Error::Cancelled)) if first_err.is_some() => {}
                Err(e) => {
                    if first_err.is_none() || matches!(first_err, Some(TaskError::Fatal(Error::Cancelled))) {
                        first_err = Some(e);
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Read every decode source of a task into its buffer
    async fn read_sources(
        &self,
        dkey: &str,
        rot: &TargetRotation,
        task: &mut RecoveryTask,
        sources: &[u32],
    ) -> std::result::Result<(), TaskError> {
        let geo = self.class.geometry;
        let mut sends = Vec::with_capacity(sources.len());
        for &src in sources {
            let iod = task.source_iod(&geo, src).map_err(TaskError::Fatal)?;
            let req = ShardRequest::new(rot.shard_idx(src), src, geo, dkey, task.epoch).with_iods(vec![iod]);
            sends.push(async move { (src, self.send(ShardOp::Fetch, req).await) });
        }

        for (src, reply) in join_all(sends).await {
            let filled = reply.and_then(|reply| {
                let data = reply.data.first().ok_or_else(|| Error::IoFailure {
                    tgt: src,
                    reason: "empty recovery reply".into(),
                })?;
                task.fill_target(&geo, src, data)
            });
            match filled {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::IoFailure => {
                    return Err(TaskError::Source { tgt: src, err })
                }
                Err(err) => return Err(TaskError::Fatal(err)),
            }
        }
        Ok(())
    }

    /// Read data no parity covers from a surviving parity replica
    #[allow(clippy::too_many_arguments)]
    async fn read_redirect(
        &self,
        dkey: &str,
        rot: &TargetRotation,
        req: &ReasbRequest,
        fail: &mut FailInfo,
        redirect: Redirect,
        epoch: u64,
        out: &mut [Vec<u8>],
    ) -> Result<()> {
        let geo = self.class.geometry;
        let (part, orig) = match redirect {
            Redirect::Array { iod_idx, frag } => {
                let iod = &req.iods[iod_idx];
                let recx = SpacedRecx::Data(frag.recx).into_raw()?;
                (
                    TargetIod {
                        iod_idx,
                        iod: Iod::array(iod.akey.clone(), iod.size, vec![recx]),
                        off: frag.user_off,
                        len: frag.recx.nr * iod.size,
                        siod: None,
                    },
                    tgt_of_idx(&geo, frag.recx.idx),
                )
            }
            Redirect::Single { iod_idx } => {
                let iod = &req.iods[iod_idx];
                (
                    TargetIod {
                        iod_idx,
                        iod: iod.clone(),
                        off: 0,
                        len: iod.size,
                        siod: None,
                    },
                    0,
                )
            }
        };

        loop {
            let replica = (geo.k()..geo.tgt_nr())
                .find(|&t| !fail.is_err(t))
                .ok_or_else(|| {
                    Error::DataLoss(format!(
                        "no surviving replica for {} of target {}",
                        part.iod.akey, orig
                    ))
                })?;
            let toiod = TargetOiod {
                tgt_idx: replica,
                orig_tgt_idx: orig,
                iods: vec![part.clone()],
            };
            debug!(
                "Reading target {} data from parity target {}",
                toiod.orig_tgt_idx, toiod.tgt_idx
            );

            match self
                .send(ShardOp::Fetch, self.shard_request(rot, &toiod, dkey, epoch))
                .await
            {
                Ok(reply) => {
                    let data = reply.data.first().ok_or_else(|| Error::IoFailure {
                        tgt: replica,
                        reason: "empty replica reply".into(),
                    })?;
                    let n = (part.len as usize).min(data.len());
                    let start = part.off as usize;
                    let dst = out[part.iod_idx].get_mut(start..start + n).ok_or_else(|| {
                        Error::InvalidArgument("user buffer too short for replica data".into())
                    })?;
                    dst.copy_from_slice(&data[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::IoFailure => fail.insert_err(replica)?,
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::codec::CodecRegistry;
    use crate::ec::geometry::ObjectClassId;
    use crate::ec::recx::Recx;
    use crate::io::memory::MemTransport;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn setup(k: u32, p: u32, cell: u64) -> (EcObject, Arc<MemTransport>) {
        let registry = CodecRegistry::builder()
            .register(ObjectClassId(1), "test", Geometry::new(k, p, cell).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let class = registry.get(ObjectClassId(1)).unwrap().clone();
        let transport = Arc::new(MemTransport::new(k + p));
        let io = IoConfig {
            shard_timeout: Duration::from_millis(200),
            ..IoConfig::default()
        };
        let obj = EcObject::new(class, transport.clone(), io, EcMetrics::new().unwrap());
        (obj, transport)
    }

    fn pattern(len: usize, seed: u8) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_dkey_hash_is_stable() {
        assert_eq!(dkey_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(dkey_hash("a"), 0xaf63_dc4c_8601_ec8c);
        assert_ne!(dkey_hash("d1"), dkey_hash("d2"));
    }

    #[tokio::test]
    async fn test_update_then_fetch() {
        let (obj, _) = setup(4, 2, 16);
        let data = pattern(100, 1);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(10, 100)])];
        let epoch = obj.update("d", &iods, &[data.clone()]).await.unwrap();
        assert_eq!(epoch, 1);

        let got = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(got[0], data);
        assert_eq!(obj.metrics().degraded_fetches.get(), 0);
    }

    #[tokio::test]
    async fn test_fetch_sees_newest_epoch() {
        let (obj, _) = setup(2, 1, 4);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 8)])];
        obj.update("d", &iods, &[pattern(8, 1)]).await.unwrap();
        obj.update("d", &iods, &[pattern(8, 2)]).await.unwrap();

        assert_eq!(obj.fetch("d", &iods).await.unwrap()[0], pattern(8, 2));
        assert_eq!(obj.fetch_at("d", &iods, 1).await.unwrap()[0], pattern(8, 1));
    }

    #[tokio::test]
    async fn test_degraded_fetch_full_stripes() {
        let (obj, transport) = setup(4, 2, 16);
        let data = pattern(320, 7);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 320)])];
        obj.update("d", &iods, &[data.clone()]).await.unwrap();

        transport.fail_shard(obj.rotation("d").shard_idx(2));
        let got = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(got[0], data);
        assert_eq!(obj.metrics().degraded_fetches.get(), 1);
        assert_eq!(obj.metrics().recovery_tasks.get(), 1);
    }

    #[tokio::test]
    async fn test_degraded_fetch_partial_stripe_redirects() {
        let (obj, transport) = setup(4, 2, 16);
        let data = pattern(20, 3);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(30, 20)])];
        obj.update("d", &iods, &[data.clone()]).await.unwrap();

        transport.fail_shard(obj.rotation("d").shard_idx(1));
        let got = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(got[0], data);
        assert_eq!(obj.metrics().recovery_tasks.get(), 0);
    }

    #[tokio::test]
    async fn test_degraded_fetch_after_partial_overwrite() {
        let (obj, transport) = setup(4, 2, 16);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 64)])];
        obj.update("d", &iods, &[pattern(64, 1)]).await.unwrap();
        let patch = vec![Iod::array("a", 1, vec![Recx::new(32, 8)])];
        obj.update("d", &patch, &[Bytes::from(vec![0xee; 8])]).await.unwrap();

        let healthy = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(&healthy[0][32..40], &[0xee; 8]);

        transport.fail_shard(obj.rotation("d").shard_idx(2));
        let degraded = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(degraded, healthy);
        assert_eq!(obj.metrics().recovery_tasks.get(), 1);
    }

    #[tokio::test]
    async fn test_degraded_fetch_with_failed_parity_source() {
        let (obj, transport) = setup(4, 2, 16);
        let data = pattern(128, 5);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 128)])];
        obj.update("d", &iods, &[data.clone()]).await.unwrap();

        let rot = obj.rotation("d");
        transport.fail_shard(rot.shard_idx(0));
        transport.fail_shard(rot.shard_idx(4));
        assert_eq!(obj.fetch("d", &iods).await.unwrap()[0], data);
    }

    #[tokio::test]
    async fn test_too_many_failures_is_data_loss() {
        let (obj, transport) = setup(4, 2, 16);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 64)])];
        obj.update("d", &iods, &[pattern(64, 1)]).await.unwrap();

        let rot = obj.rotation("d");
        for t in 0..3 {
            transport.fail_shard(rot.shard_idx(t));
        }
        assert_matches!(obj.fetch("d", &iods).await, Err(Error::DataLoss(_)));
        assert_eq!(obj.metrics().data_loss.get(), 1);
    }

    #[tokio::test]
    async fn test_update_fails_on_unavailable_target() {
        let (obj, transport) = setup(2, 1, 4);
        transport.fail_shard(obj.rotation("d").shard_idx(2));
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 8)])];
        assert_matches!(
            obj.update("d", &iods, &[pattern(8, 1)]).await,
            Err(Error::IoFailure { tgt: 2, .. })
        );
    }

    #[tokio::test]
    async fn test_slow_target_times_out_and_is_recovered() {
        let (obj, transport) = setup(2, 1, 4);
        let data = pattern(8, 9);
        let iods = vec![Iod::array("a", 1, vec![Recx::new(0, 8)])];
        obj.update("d", &iods, &[data.clone()]).await.unwrap();

        transport.delay_shard(obj.rotation("d").shard_idx(1), Duration::from_secs(5));
        assert_eq!(obj.fetch("d", &iods).await.unwrap()[0], data);
        let text = obj.metrics().gather_text().unwrap();
        assert!(text.contains("outcome=\"timeout\""));
    }

    #[tokio::test]
    async fn test_single_values() {
        let (obj, transport) = setup(4, 2, 16);
        let small = pattern(100, 1);
        let big = pattern(10_000, 2);
        let iods = vec![Iod::single("s", 100), Iod::single("b", 10_000)];
        obj.update("d", &iods, &[small.clone(), big.clone()]).await.unwrap();

        let got = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(got, vec![small.clone(), big.clone()]);

        let shard0 = obj.rotation("d").shard_idx(0);
        transport.fail_shard(shard0);
        let got = obj.fetch("d", &iods).await.unwrap();
        assert_eq!(got, vec![small, big]);

        transport.heal_shard(shard0);
        assert_matches!(
            obj.fetch("d", &[Iod::single("s", 50)]).await,
            Err(Error::InvalidArgument(_))
        );
    }
}
