//! Transport seam between the object layer and its targets

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ec::geometry::Geometry;
use crate::ec::iod::Iod;
use crate::ec::recx::RecxEpList;
use crate::error::Result;

/// One target's part of a request
#[derive(Debug, Clone)]
pub struct ShardRequest {
    /// Physical shard the request is addressed to
    pub shard: u32,
    /// Logical target offset within the EC group
    pub tgt_off: u32,
    pub geometry: Geometry,
    pub dkey: String,
    pub epoch: u64,
    /// Logical extents, parity extents carry the parity indicator
    pub iods: Vec<Iod>,
    /// One buffer per IOD for updates, empty for fetches
    pub data: Vec<Bytes>,
    /// Report the parity extents held for each array IOD
    pub query_parity: bool,
}

impl ShardRequest {
    pub fn new(shard: u32, tgt_off: u32, geometry: Geometry, dkey: &str, epoch: u64) -> Self {
        Self {
            shard,
            tgt_off,
            geometry,
            dkey: dkey.to_string(),
            epoch,
            iods: Vec::new(),
            data: Vec::new(),
            query_parity: false,
        }
    }

    pub fn with_iods(mut self, iods: Vec<Iod>) -> Self {
        self.iods = iods;
        self
    }

    pub fn with_data(mut self, data: Vec<Bytes>) -> Self {
        self.data = data;
        self
    }

    pub fn with_parity_query(mut self) -> Self {
        self.query_parity = true;
        self
    }
}

/// A target's answer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardReply {
    pub shard: u32,
    /// One buffer per IOD of the request
    #[serde(skip)]
    pub data: Vec<Bytes>,
    /// Record size, or stored size of a single value, per IOD; zero when
    /// nothing is stored
    pub sizes: Vec<u64>,
    /// Parity shadow lists, one per IOD, when requested
    pub parity_lists: Option<Vec<RecxEpList>>,
    /// Replica lists, one per IOD, alongside the parity lists
    pub replica_lists: Option<Vec<RecxEpList>>,
}

/// Ships shard requests to targets
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn update(&self, req: ShardRequest) -> Result<ShardReply>;

    async fn fetch(&self, req: ShardRequest) -> Result<ShardReply>;
}
