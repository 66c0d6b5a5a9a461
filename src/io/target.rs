//! Target-side request handling
//!
//! A target receives logical descriptors and stores them in one of three
//! places:
//!
//! ```text
//!   parity extent (indicator set)    → parity space, stripe s at s * cell
//!   data extent on a data target     → data space, mapped to physical index
//!   data extent on a parity target   → data space, unmapped (replica)
//! ```

use bytes::Bytes;
use tracing::{debug, instrument};

use super::transport::{ShardReply, ShardRequest};
use crate::ec::geometry::Geometry;
use crate::ec::iod::Iod;
use crate::ec::recx::{AddrSpace, Recx, RecxEpList, SpacedRecx};
use crate::ec::translate::{logical_to_physical, recxs_to_physical};
use crate::error::{try_alloc, Error, Result};

/// Versioned extent storage of one target
pub trait ExtentStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        dkey: &str,
        akey: &str,
        space: AddrSpace,
        recx: Recx,
        epoch: u64,
        rec_size: u64,
        data: Bytes,
    ) -> Result<()>;

    /// Latest records visible at `epoch`, holes read as zeroes
    fn read(
        &self,
        dkey: &str,
        akey: &str,
        space: AddrSpace,
        recx: Recx,
        epoch: u64,
        rec_size: u64,
    ) -> Result<Bytes>;

    /// Parity extents visible at `epoch`, indicator set, with their epochs
    fn parity_list(&self, dkey: &str, akey: &str, epoch: u64) -> Result<RecxEpList>;

    /// Data-space extents visible at `epoch`, newest version per range
    fn replica_list(&self, dkey: &str, akey: &str, epoch: u64) -> Result<RecxEpList>;

    fn write_single(&self, dkey: &str, akey: &str, epoch: u64, gsize: u64, data: Bytes) -> Result<()>;

    /// Global size and local bytes of the single value visible at `epoch`
    fn read_single(&self, dkey: &str, akey: &str, epoch: u64) -> Result<Option<(u64, Bytes)>>;
}

/// Where an extent lives on this target
fn placement(geo: &Geometry, tgt_off: u32, recx: Recx) -> Result<(AddrSpace, Recx)> {
    match SpacedRecx::from_raw(recx) {
        SpacedRecx::Parity(r) => {
            if !geo.is_parity_tgt(tgt_off) {
                return Err(Error::InvalidArgument(format!(
                    "parity extent {} sent to data target {}",
                    recx, tgt_off
                )));
            }
            let stripe = geo.stripe_rec_nr();
            if r.idx % stripe != 0 || r.nr % stripe != 0 {
                return Err(Error::InvalidArgument(format!(
                    "parity extent {} is not stripe aligned",
                    recx
                )));
            }
            let phys = Recx::new(logical_to_physical(geo, r.idx), r.nr / stripe * geo.cell_rec_nr());
            Ok((AddrSpace::Parity, phys))
        }
        SpacedRecx::Data(r) if geo.is_data_tgt(tgt_off) => {
            let mapped = recxs_to_physical(geo, &[r])?;
            Ok((AddrSpace::Data, mapped[0]))
        }
        SpacedRecx::Data(r) => Ok((AddrSpace::Data, r)),
    }
}

/// Serves shard requests against an extent store
#[derive(Debug)]
pub struct TargetService<S> {
    shard: u32,
    store: S,
}

impl<S: ExtentStore> TargetService<S> {
    pub fn new(shard: u32, store: S) -> Self {
        Self { shard, store }
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[instrument(skip(self, req), fields(shard = self.shard, tgt = req.tgt_off, epoch = req.epoch))]
    pub fn handle_update(&self, req: &ShardRequest) -> Result<ShardReply> {
        if req.data.len() != req.iods.len() {
            return Err(Error::InvalidArgument(format!(
                "{} buffers for {} iods",
                req.data.len(),
                req.iods.len()
            )));
        }
        let geo = &req.geometry;
        let mut sizes = try_alloc(req.iods.len(), "reply sizes")?;

        for (iod, data) in req.iods.iter().zip(&req.data) {
            if iod.is_single() {
                self.store
                    .write_single(&req.dkey, &iod.akey, req.epoch, iod.size, data.clone())?;
                sizes.push(iod.size);
                continue;
            }

            let mut pos = 0usize;
            for recx in &iod.recxs {
                let (space, stored) = placement(geo, req.tgt_off, *recx)?;
                let len = (stored.nr * iod.size) as usize;
                if pos + len > data.len() {
                    return Err(Error::InvalidArgument(format!(
                        "buffer of {} bytes too short for extent {} of {}",
                        data.len(),
                        recx,
                        iod.akey
                    )));
                }
                self.store.write(
                    &req.dkey,
                    &iod.akey,
                    space,
                    stored,
                    req.epoch,
                    iod.size,
                    data.slice(pos..pos + len),
                )?;
                pos += len;
            }
            if pos != data.len() {
                return Err(Error::InvalidArgument(format!(
                    "iod {} covers {} bytes, buffer has {}",
                    iod.akey,
                    pos,
                    data.len()
                )));
            }
            sizes.push(iod.size);
        }

        debug!("Stored {} iods", req.iods.len());
        Ok(ShardReply {
            shard: self.shard,
            data: Vec::new(),
            sizes,
            parity_lists: None,
            replica_lists: None,
        })
    }

    #[instrument(skip(self, req), fields(shard = self.shard, tgt = req.tgt_off, epoch = req.epoch))]
    pub fn handle_fetch(&self, req: &ShardRequest) -> Result<ShardReply> {
        let geo = &req.geometry;
        let mut data = try_alloc(req.iods.len(), "reply buffers")?;
        let mut sizes = try_alloc(req.iods.len(), "reply sizes")?;

        for iod in &req.iods {
            if iod.is_single() {
                match self.store.read_single(&req.dkey, &iod.akey, req.epoch)? {
                    Some((gsize, bytes)) => {
                        sizes.push(gsize);
                        data.push(bytes);
                    }
                    None => {
                        sizes.push(0);
                        data.push(Bytes::new());
                    }
                }
                continue;
            }
            data.push(self.read_array(geo, req, iod)?);
            sizes.push(iod.size);
        }

        let (parity_lists, replica_lists) = if req.query_parity {
            let (parity, replicas) = self.shadow_lists(req)?;
            (Some(parity), Some(replicas))
        } else {
            (None, None)
        };

        Ok(ShardReply {
            shard: self.shard,
            data,
            sizes,
            parity_lists,
            replica_lists,
        })
    }

    /// Parity and replica lists per IOD
    ///
    /// Only parity targets keep replicas in the data space; data targets
    /// report none.
    fn shadow_lists(&self, req: &ShardRequest) -> Result<(Vec<RecxEpList>, Vec<RecxEpList>)> {
        let mut parity = try_alloc(req.iods.len(), "parity lists")?;
        let mut replicas = try_alloc(req.iods.len(), "replica lists")?;
        let holds_replicas = req.geometry.is_parity_tgt(req.tgt_off);
        for iod in &req.iods {
            if iod.is_single() {
                parity.push(RecxEpList::new(true));
                replicas.push(RecxEpList::new(true));
                continue;
            }
            parity.push(self.store.parity_list(&req.dkey, &iod.akey, req.epoch)?);
            if holds_replicas {
                replicas.push(self.store.replica_list(&req.dkey, &iod.akey, req.epoch)?);
            } else {
                replicas.push(RecxEpList::new(true));
            }
        }
        Ok((parity, replicas))
    }

    fn read_array(&self, geo: &Geometry, req: &ShardRequest, iod: &Iod) -> Result<Bytes> {
        if let [recx] = iod.recxs.as_slice() {
            let (space, stored) = placement(geo, req.tgt_off, *recx)?;
            return self
                .store
                .read(&req.dkey, &iod.akey, space, stored, req.epoch, iod.size);
        }
        let mut out = Vec::new();
        for recx in &iod.recxs {
            let (space, stored) = placement(geo, req.tgt_off, *recx)?;
            let bytes = self
                .store
                .read(&req.dkey, &iod.akey, space, stored, req.epoch, iod.size)?;
            out.extend_from_slice(&bytes);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::recx::{set_parity, PARITY_INDICATOR};
    use crate::io::memory::MemStore;
    use assert_matches::assert_matches;

    fn geo() -> Geometry {
        Geometry::new(4, 2, 16).unwrap()
    }

    fn request(tgt_off: u32, epoch: u64, iods: Vec<Iod>) -> ShardRequest {
        ShardRequest::new(tgt_off, tgt_off, geo(), "d", epoch).with_iods(iods)
    }

    #[test]
    fn test_data_target_maps_extents() {
        let svc = TargetService::new(1, MemStore::new());
        let data = Bytes::from(vec![3u8; 8]);
        let req = request(1, 1, vec![Iod::array("a", 1, vec![Recx::new(80, 8)])])
            .with_data(vec![data.clone()]);
        svc.handle_update(&req).unwrap();

        // [80, 88) is cell 1 of stripe 1, physical [16, 24)
        let stored = svc
            .store()
            .read("d", "a", AddrSpace::Data, Recx::new(16, 8), 1, 1)
            .unwrap();
        assert_eq!(stored, data);

        let reply = svc
            .handle_fetch(&request(1, 5, vec![Iod::array("a", 1, vec![Recx::new(80, 8)])]))
            .unwrap();
        assert_eq!(reply.data[0], data);
        assert!(reply.parity_lists.is_none());
    }

    #[test]
    fn test_parity_target_stores_replica_and_parity() {
        let svc = TargetService::new(4, MemStore::new());
        let parity = Recx::new(set_parity(64).unwrap(), 128);
        let replica = Recx::new(200, 4);
        let mut buf = vec![1u8; 2 * 16];
        buf.extend_from_slice(&[9, 9, 9, 9]);
        let req = request(4, 3, vec![Iod::array("a", 1, vec![parity, replica])])
            .with_data(vec![Bytes::from(buf)]);
        svc.handle_update(&req).unwrap();

        let p = svc
            .store()
            .read("d", "a", AddrSpace::Parity, Recx::new(16, 32), 3, 1)
            .unwrap();
        assert!(p.iter().all(|&b| b == 1));
        let r = svc
            .store()
            .read("d", "a", AddrSpace::Data, Recx::new(200, 4), 3, 1)
            .unwrap();
        assert_eq!(&r[..], &[9, 9, 9, 9]);

        let reply = svc
            .handle_fetch(&request(4, 3, vec![Iod::array("a", 1, Vec::new())]).with_parity_query())
            .unwrap();
        let lists = reply.parity_lists.unwrap();
        assert_eq!(lists[0].items.len(), 1);
        assert_eq!(lists[0].items[0].recx, Recx::new(PARITY_INDICATOR | 16, 32));
        assert_eq!(lists[0].items[0].epoch, 3);
        let replicas = reply.replica_lists.unwrap();
        assert_eq!(replicas[0].items.len(), 1);
        assert_eq!(replicas[0].items[0].recx, Recx::new(200, 4));
    }

    #[test]
    fn test_rejects_misrouted_parity() {
        let svc = TargetService::new(0, MemStore::new());
        let req = request(0, 1, vec![Iod::array("a", 1, vec![Recx::new(PARITY_INDICATOR, 64)])])
            .with_data(vec![Bytes::from(vec![0u8; 16])]);
        assert_matches!(svc.handle_update(&req), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_rejects_short_buffer() {
        let svc = TargetService::new(0, MemStore::new());
        let req = request(0, 1, vec![Iod::array("a", 2, vec![Recx::new(0, 4)])])
            .with_data(vec![Bytes::from(vec![0u8; 4])]);
        assert_matches!(svc.handle_update(&req), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_single_value_versions() {
        let svc = TargetService::new(0, MemStore::new());
        let write = |epoch, byte| {
            let req = request(0, epoch, vec![Iod::single("s", 3)])
                .with_data(vec![Bytes::from(vec![byte; 3])]);
            svc.handle_update(&req).unwrap();
        };
        write(2, 0xa);
        write(4, 0xb);

        let at = |epoch| svc.handle_fetch(&request(0, epoch, vec![Iod::single("s", 3)])).unwrap();
        assert_eq!(at(1).sizes, vec![0]);
        assert_eq!(&at(3).data[0][..], &[0xa; 3]);
        assert_eq!(&at(9).data[0][..], &[0xb; 3]);
    }
}
