//! In-Memory Targets
//!
//! A versioned extent store and an in-process transport over a group of
//! targets, with shard fault injection. Used by the tests and the
//! `simulate` command.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::target::{ExtentStore, TargetService};
use super::transport::{ShardReply, ShardRequest, ShardTransport};
use crate::ec::recx::{set_parity, AddrSpace, Recx, RecxEpList};
use crate::error::{try_alloc_zeroed, Error, Result};

// =============================================================================
// Extent Store
// =============================================================================

#[derive(Debug, Clone)]
struct Extent {
    recx: Recx,
    epoch: u64,
    rec_size: u64,
    data: Bytes,
}

#[derive(Debug, Clone)]
struct SingleVersion {
    epoch: u64,
    gsize: u64,
    data: Bytes,
}

type ArrayKey = (String, String, AddrSpace);
type SingleKey = (String, String);

/// Extent store keeping every version in memory
#[derive(Debug, Default)]
pub struct MemStore {
    /// Extents per key, ascending epoch, later writes after earlier ones
    arrays: DashMap<ArrayKey, Vec<Extent>>,
    singles: DashMap<SingleKey, Vec<SingleVersion>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Newest extent covering each stretch of an address space, adjacent
    /// stretches of one version merged
    fn visible_runs(&self, dkey: &str, akey: &str, space: AddrSpace, epoch: u64) -> Vec<(Recx, u64, u64)> {
        let Some(extents) = self.arrays.get(&(dkey.to_string(), akey.to_string(), space)) else {
            return Vec::new();
        };
        let visible: Vec<&Extent> = extents.iter().take_while(|e| e.epoch <= epoch).collect();

        let mut bounds: Vec<u64> = visible
            .iter()
            .flat_map(|e| [e.recx.idx, e.recx.end()])
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        let mut runs: Vec<(Recx, u64, u64)> = Vec::new();
        for w in bounds.windows(2) {
            let seg = Recx::new(w[0], w[1] - w[0]);
            let Some(top) = visible.iter().rev().find(|e| e.recx.covers(&seg)) else {
                continue;
            };
            match runs.last_mut() {
                Some((r, ep, rs)) if r.end() == seg.idx && *ep == top.epoch && *rs == top.rec_size => {
                    r.nr += seg.nr;
                }
                _ => runs.push((seg, top.epoch, top.rec_size)),
            }
        }
        runs
    }

    /// Number of stored extent versions in an address space
    pub fn extent_nr(&self, dkey: &str, akey: &str, space: AddrSpace) -> usize {
        self.arrays
            .get(&(dkey.to_string(), akey.to_string(), space))
            .map_or(0, |v| v.len())
    }
}

impl ExtentStore for MemStore {
    fn write(
        &self,
        dkey: &str,
        akey: &str,
        space: AddrSpace,
        recx: Recx,
        epoch: u64,
        rec_size: u64,
        data: Bytes,
    ) -> Result<()> {
        if data.len() as u64 != recx.nr * rec_size {
            return Err(Error::InvalidArgument(format!(
                "{} bytes for extent {} of {} byte records",
                data.len(),
                recx,
                rec_size
            )));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut extents = self
            .arrays
            .entry((dkey.to_string(), akey.to_string(), space))
            .or_default();
        let pos = extents.partition_point(|e| e.epoch <= epoch);
        extents.insert(
            pos,
            Extent {
                recx,
                epoch,
                rec_size,
                data,
            },
        );
        Ok(())
    }

    fn read(
        &self,
        dkey: &str,
        akey: &str,
        space: AddrSpace,
        recx: Recx,
        epoch: u64,
        rec_size: u64,
    ) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut buf = try_alloc_zeroed((recx.nr * rec_size) as usize, "read buffer")?;
        let Some(extents) = self
            .arrays
            .get(&(dkey.to_string(), akey.to_string(), space))
        else {
            return Ok(Bytes::from(buf));
        };

        for ext in extents.iter().take_while(|e| e.epoch <= epoch) {
            let Some(hit) = ext.recx.intersect(&recx) else {
                continue;
            };
            if ext.rec_size != rec_size {
                return Err(Error::InvalidArgument(format!(
                    "record size {} read over extent {} of {} byte records",
                    rec_size, ext.recx, ext.rec_size
                )));
            }
            let src = ((hit.idx - ext.recx.idx) * rec_size) as usize;
            let dst = ((hit.idx - recx.idx) * rec_size) as usize;
            let len = (hit.nr * rec_size) as usize;
            buf[dst..dst + len].copy_from_slice(&ext.data[src..src + len]);
        }
        Ok(Bytes::from(buf))
    }

    fn parity_list(&self, dkey: &str, akey: &str, epoch: u64) -> Result<RecxEpList> {
        let mut list = RecxEpList::new(true);
        for (recx, ep, rec_size) in self.visible_runs(dkey, akey, AddrSpace::Parity, epoch) {
            list.push(Recx::new(set_parity(recx.idx)?, recx.nr), ep, rec_size);
        }
        Ok(list)
    }

    fn replica_list(&self, dkey: &str, akey: &str, epoch: u64) -> Result<RecxEpList> {
        let mut list = RecxEpList::new(true);
        for (recx, ep, rec_size) in self.visible_runs(dkey, akey, AddrSpace::Data, epoch) {
            list.push(recx, ep, rec_size);
        }
        Ok(list)
    }

    fn write_single(&self, dkey: &str, akey: &str, epoch: u64, gsize: u64, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut versions = self
            .singles
            .entry((dkey.to_string(), akey.to_string()))
            .or_default();
        let pos = versions.partition_point(|v| v.epoch <= epoch);
        versions.insert(pos, SingleVersion { epoch, gsize, data });
        Ok(())
    }

    fn read_single(&self, dkey: &str, akey: &str, epoch: u64) -> Result<Option<(u64, Bytes)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .singles
            .get(&(dkey.to_string(), akey.to_string()))
            .and_then(|v| {
                v.iter()
                    .rev()
                    .find(|s| s.epoch <= epoch)
                    .map(|s| (s.gsize, s.data.clone()))
            }))
    }
}

// =============================================================================
// In-Process Transport
// =============================================================================

/// Transport delivering requests to in-process targets
pub struct MemTransport {
    targets: Vec<Arc<TargetService<MemStore>>>,
    failed: RwLock<HashSet<u32>>,
    delays: DashMap<u32, Duration>,
}

impl MemTransport {
    /// One empty target per shard
    pub fn new(shard_nr: u32) -> Self {
        Self {
            targets: (0..shard_nr)
                .map(|s| Arc::new(TargetService::new(s, MemStore::new())))
                .collect(),
            failed: RwLock::new(HashSet::new()),
            delays: DashMap::new(),
        }
    }

    pub fn shard_nr(&self) -> u32 {
        self.targets.len() as u32
    }

    pub fn target(&self, shard: u32) -> Option<&TargetService<MemStore>> {
        self.targets.get(shard as usize).map(|t| t.as_ref())
    }

    /// Make every request to a shard fail
    pub fn fail_shard(&self, shard: u32) {
        warn!("Injecting failure on shard {}", shard);
        self.failed.write().insert(shard);
    }

    pub fn heal_shard(&self, shard: u32) {
        debug!("Healing shard {}", shard);
        self.failed.write().remove(&shard);
        self.delays.remove(&shard);
    }

    /// Delay every request to a shard
    pub fn delay_shard(&self, shard: u32, delay: Duration) {
        self.delays.insert(shard, delay);
    }

    pub fn failed_shards(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.failed.read().iter().copied().collect();
        v.sort_unstable();
        v
    }

    async fn route(&self, req: &ShardRequest) -> Result<Arc<TargetService<MemStore>>> {
        let delay = self.delays.get(&req.shard).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failed.read().contains(&req.shard) {
            return Err(Error::IoFailure {
                tgt: req.tgt_off,
                reason: format!("shard {} unavailable", req.shard),
            });
        }
        self.targets
            .get(req.shard as usize)
            .cloned()
            .ok_or_else(|| Error::IoFailure {
                tgt: req.tgt_off,
                reason: format!("no shard {}", req.shard),
            })
    }
}

#[async_trait]
impl ShardTransport for MemTransport {
    async fn update(&self, req: ShardRequest) -> Result<ShardReply> {
        self.route(&req).await?.handle_update(&req)
    }

    async fn fetch(&self, req: ShardRequest) -> Result<ShardReply> {
        self.route(&req).await?.handle_fetch(&req)
    }
}
