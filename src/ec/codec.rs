//! EC Codec and Codec Registry
//!
//! A [`Codec`] owns the encode matrix and expanded parity tables for one
//! `(k, p)` pair. The [`CodecRegistry`] maps object classes to their geometry
//! and shared codec. It is built once at startup and handed to request code
//! as an immutable value, so concurrent readers never synchronize.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::geometry::{Geometry, ObjectClassId};
use super::gf::{gen_encode_matrix, GfTables};
use crate::config::EcConfig;
use crate::error::{Error, Result};

// =============================================================================
// Codec
// =============================================================================

/// Reed-Solomon codec for one `(k, p)` pair
#[derive(Debug)]
pub struct Codec {
    /// Number of data cells (k)
    data_shards: usize,
    /// Number of parity cells (p)
    parity_shards: usize,
    /// Encode matrix, `(k + p)` rows by `k` columns, identity on top
    encode_matrix: Vec<u8>,
    /// Expanded tables for the `p` parity rows
    parity_tables: GfTables,
}

impl Codec {
    /// Create a codec for `k` data and `p` parity cells
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }

        let encode_matrix = gen_encode_matrix(data_shards, parity_shards)?;
        let parity_tables = GfTables::expand(
            &encode_matrix[data_shards * data_shards..],
            parity_shards,
            data_shards,
        )?;

        debug!(
            "Built {}+{} codec with {} parity tables",
            data_shards,
            parity_shards,
            parity_shards * data_shards
        );

        Ok(Self {
            data_shards,
            parity_shards,
            encode_matrix,
            parity_tables,
        })
    }

    /// Get the number of data cells
    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    /// Get the number of parity cells
    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Get the total number of cells in a stripe
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Full encode matrix, used to derive decode matrices
    pub fn encode_matrix(&self) -> &[u8] {
        &self.encode_matrix
    }

    /// Encode matrix row of one target
    pub fn matrix_row(&self, tgt: usize) -> &[u8] {
        &self.encode_matrix[tgt * self.data_shards..(tgt + 1) * self.data_shards]
    }

    /// Expanded tables for the parity rows
    pub fn parity_tables(&self) -> &GfTables {
        &self.parity_tables
    }

    /// Compute parity cells from data cells
    ///
    /// All cells must share one length.
    pub fn encode(&self, data: &[&[u8]], parity: &mut [&mut [u8]]) -> Result<()> {
        self.validate_cells(data.len(), parity.len())?;
        let len = data.first().map(|d| d.len()).unwrap_or(0);
        if data.iter().any(|d| d.len() != len) || parity.iter().any(|p| p.len() != len) {
            return Err(Error::InvalidArgument(format!(
                "cells must all be {} bytes",
                len
            )));
        }
        if self.parity_shards == 0 {
            return Ok(());
        }
        self.parity_tables.vector_multiply(len, data, parity)
    }

    /// Check that parity cells match their data cells
    pub fn verify(&self, data: &[&[u8]], parity: &[&[u8]]) -> Result<bool> {
        self.validate_cells(data.len(), parity.len())?;
        let len = data.first().map(|d| d.len()).unwrap_or(0);
        let mut expected: Vec<Vec<u8>> = vec![vec![0u8; len]; self.parity_shards];
        {
            let mut refs: Vec<&mut [u8]> = expected.iter_mut().map(|v| v.as_mut_slice()).collect();
            self.encode(data, &mut refs)?;
        }
        Ok(expected.iter().zip(parity).all(|(e, p)| e.as_slice() == *p))
    }

    fn validate_cells(&self, data: usize, parity: usize) -> Result<()> {
        if data != self.data_shards {
            return Err(Error::InvalidEcConfig(format!(
                "expected {} data cells, got {}",
                self.data_shards, data
            )));
        }
        if parity != self.parity_shards {
            return Err(Error::InvalidEcConfig(format!(
                "expected {} parity cells, got {}",
                self.parity_shards, parity
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A registered object class with its shared codec
#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub id: ObjectClassId,
    pub name: String,
    pub geometry: Geometry,
    pub codec: Arc<Codec>,
}

/// Immutable object class to codec table
#[derive(Debug, Default)]
pub struct CodecRegistry {
    classes: HashMap<ObjectClassId, ClassEntry>,
    codec_nr: usize,
}

impl CodecRegistry {
    /// Start building a registry
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default()
    }

    /// Build the registry from the configured class catalog
    #[instrument(skip(config))]
    pub fn from_config(config: &EcConfig) -> Result<Self> {
        let mut builder = Self::builder();
        for class in &config.classes {
            let geometry = Geometry::new(
                class.data_targets,
                class.parity_targets,
                class.cell_records,
            )?;
            builder = builder.register(ObjectClassId(class.id), &class.name, geometry)?;
        }
        builder.build()
    }

    /// Look up an object class
    pub fn get(&self, id: ObjectClassId) -> Result<&ClassEntry> {
        self.classes.get(&id).ok_or(Error::ClassNotFound(id.0))
    }

    /// Look up an object class by name
    pub fn by_name(&self, name: &str) -> Option<&ClassEntry> {
        self.classes.values().find(|c| c.name == name)
    }

    /// Registered classes, ordered by id
    pub fn classes(&self) -> Vec<&ClassEntry> {
        let mut all: Vec<_> = self.classes.values().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is registered
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Number of distinct codecs shared by the classes
    pub fn codec_nr(&self) -> usize {
        self.codec_nr
    }
}

/// Collects classes and builds each distinct codec once
#[derive(Debug, Default)]
pub struct CodecRegistryBuilder {
    classes: Vec<(ObjectClassId, String, Geometry)>,
}

impl CodecRegistryBuilder {
    /// Register an object class
    pub fn register(mut self, id: ObjectClassId, name: &str, geometry: Geometry) -> Result<Self> {
        if self.classes.iter().any(|(existing, _, _)| *existing == id) {
            return Err(Error::InvalidEcConfig(format!(
                "object class {} registered twice",
                id
            )));
        }
        self.classes.push((id, name.to_string(), geometry));
        Ok(self)
    }

    /// Build every codec and freeze the registry
    pub fn build(self) -> Result<CodecRegistry> {
        let mut codecs: HashMap<(u32, u32), Arc<Codec>> = HashMap::new();
        let mut classes = HashMap::with_capacity(self.classes.len());

        for (id, name, geometry) in self.classes {
            let key = (geometry.k(), geometry.p());
            let codec = match codecs.get(&key) {
                Some(codec) => codec.clone(),
                None => {
                    let codec = Arc::new(Codec::new(geometry.k() as usize, geometry.p() as usize)?);
                    codecs.insert(key, codec.clone());
                    codec
                }
            };
            classes.insert(
                id,
                ClassEntry {
                    id,
                    name,
                    geometry,
                    codec,
                },
            );
        }

        info!(
            "Codec registry ready: {} classes, {} codecs",
            classes.len(),
            codecs.len()
        );

        Ok(CodecRegistry {
            classes,
            codec_nr: codecs.len(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|j| (i * 31 + j * 7) as u8).collect())
            .collect()
    }

    #[test]
    fn test_codec_new() {
        let codec = Codec::new(4, 2).unwrap();
        assert_eq!(codec.data_shards(), 4);
        assert_eq!(codec.parity_shards(), 2);
        assert_eq!(codec.total_shards(), 6);
        assert_eq!(codec.encode_matrix().len(), 24);
        assert_eq!(codec.matrix_row(1), &[0, 1, 0, 0]);
        assert!(Codec::new(0, 2).is_err());
    }

    #[test]
    fn test_encode_verify() {
        let codec = Codec::new(4, 2).unwrap();
        let data = cells(4, 64);
        let data_refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let mut parity = vec![vec![0u8; 64]; 2];
        {
            let mut prefs: Vec<&mut [u8]> = parity.iter_mut().map(|p| p.as_mut_slice()).collect();
            codec.encode(&data_refs, &mut prefs).unwrap();
        }
        let prefs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
        assert!(codec.verify(&data_refs, &prefs).unwrap());

        parity[1][3] ^= 0xff;
        let prefs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
        assert!(!codec.verify(&data_refs, &prefs).unwrap());
    }

    #[test]
    fn test_encode_wrong_shape() {
        let codec = Codec::new(4, 2).unwrap();
        let data = cells(3, 8);
        let data_refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let mut parity = vec![vec![0u8; 8]; 2];
        let mut prefs: Vec<&mut [u8]> = parity.iter_mut().map(|p| p.as_mut_slice()).collect();
        assert!(codec.encode(&data_refs, &mut prefs).is_err());
    }

    #[test]
    fn test_registry_shares_codecs() {
        let registry = CodecRegistry::builder()
            .register(ObjectClassId(1), "EC_4P2_A", Geometry::new(4, 2, 16).unwrap())
            .unwrap()
            .register(ObjectClassId(2), "EC_4P2_B", Geometry::new(4, 2, 1024).unwrap())
            .unwrap()
            .register(ObjectClassId(3), "EC_8P2", Geometry::new(8, 2, 16).unwrap())
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.codec_nr(), 2);

        let a = registry.get(ObjectClassId(1)).unwrap();
        let b = registry.get(ObjectClassId(2)).unwrap();
        assert!(Arc::ptr_eq(&a.codec, &b.codec));
        assert_eq!(registry.by_name("EC_8P2").unwrap().geometry.k(), 8);
        assert!(matches!(
            registry.get(ObjectClassId(9)),
            Err(Error::ClassNotFound(9))
        ));
    }

    #[test]
    fn test_registry_duplicate_class() {
        let geo = Geometry::new(2, 1, 16).unwrap();
        let result = CodecRegistry::builder()
            .register(ObjectClassId(1), "A", geo)
            .unwrap()
            .register(ObjectClassId(1), "B", geo);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_from_default_config() {
        let registry = CodecRegistry::from_config(&EcConfig::default()).unwrap();
        assert!(!registry.is_empty());
        assert!(registry.by_name("EC_4P2").is_some());
    }
}
