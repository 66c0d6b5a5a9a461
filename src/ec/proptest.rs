//! Property-Based Tests for the EC Core
//!
//! Uses proptest to check the addressing laws and recovery guarantees over
//! a wide range of geometries.
//!
//! # Test Properties
//!
//! 1. **Round Trip**: physical → logical → physical is the identity
//! 2. **Cell Breaking**: pieces are single-cell and sum to the original
//! 3. **Rotation**: shard index and target offset are inverses
//! 4. **Reassembly**: fetched fragments rebuild the exact user layout
//! 5. **Recovery**: any `≤ p` failed targets are rebuilt, `> p` fail

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use super::codec::{Codec, CodecRegistry};
use super::geometry::{Geometry, ObjectClassId};
use super::iod::Iod;
use super::reasb::reassemble;
use super::recovery::RecoveryCodec;
use super::recx::{clear_parity, set_parity, Recx, PARITY_INDICATOR};
use super::translate::{
    break_recx, logical_to_physical, physical_to_logical, recx_cell_nr, TargetRotation,
};

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for generating geometries: k 1-8, p 0-3, cell 1-64 records
fn geometry_strategy() -> impl Strategy<Value = Geometry> {
    (1u32..=8, 0u32..=3, 1u64..=64).prop_map(|(k, p, cell)| {
        Geometry::new(k, p, cell).expect("strategy yields valid geometry")
    })
}

/// Strategy for user extents within the first few thousand records
fn recx_strategy() -> impl Strategy<Value = Recx> {
    (0u64..4096, 1u64..1024).prop_map(|(idx, nr)| Recx::new(idx, nr))
}

/// Strategy for failed target sets of a `k + p` group
fn erasure_strategy(total: usize, max: usize) -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0..total as u32, 0..=max).prop_map(|mut v| {
        v.sort();
        v.dedup();
        v
    })
}

// =============================================================================
// Translation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: mapping a physical index to logical and back is lossless.
    #[test]
    fn prop_physical_roundtrip(
        geo in geometry_strategy(),
        tgt_seed in any::<u32>(),
        phys in 0u64..(1 << 40),
    ) {
        let tgt = tgt_seed % geo.k();
        let logical = physical_to_logical(&geo, phys, tgt);
        prop_assert_eq!(logical_to_physical(&geo, logical), phys);
    }

    /// Property: the parity indicator cannot be set or cleared twice.
    #[test]
    fn prop_parity_bit_idempotence(idx in 0u64..PARITY_INDICATOR) {
        let parity = set_parity(idx)?;
        prop_assert!(set_parity(parity).is_err());
        prop_assert_eq!(clear_parity(parity)?, idx);
        prop_assert!(clear_parity(idx).is_err());
    }

    /// Property: broken pieces are contiguous, single-cell and complete.
    #[test]
    fn prop_break_completeness(geo in geometry_strategy(), recx in recx_strategy()) {
        let pieces = break_recx(&geo, &recx)?;
        prop_assert_eq!(pieces.len() as u64, recx_cell_nr(&geo, &recx));
        prop_assert_eq!(pieces.iter().map(|p| p.nr).sum::<u64>(), recx.nr);

        let mut next = recx.idx;
        for (i, piece) in pieces.iter().enumerate() {
            prop_assert_eq!(piece.idx, next);
            prop_assert_eq!(recx_cell_nr(&geo, piece), 1);
            if i > 0 {
                prop_assert_eq!(piece.idx % geo.cell_rec_nr(), 0);
            }
            next = piece.end();
        }
    }

    /// Property: N whole cells count as N, one record short of N+1 as N+1.
    #[test]
    fn prop_cell_coverage(cell in 2u64..=64, first in 0u64..100, n in 1u64..50) {
        let geo = Geometry::new(4, 2, cell)?;
        let exact = Recx::new(first * cell, n * cell);
        prop_assert_eq!(recx_cell_nr(&geo, &exact), n);
        let short = Recx::new(first * cell, (n + 1) * cell - 1);
        prop_assert_eq!(recx_cell_nr(&geo, &short), n + 1);
    }

    /// Property: shard index and target offset are inverses.
    #[test]
    fn prop_rotation_consistency(
        geo in geometry_strategy(),
        layout_ver in 0u16..=1,
        hash in any::<u64>(),
    ) {
        let rot = TargetRotation::new(&geo, layout_ver, hash);
        prop_assert!(rot.start() < geo.tgt_nr());
        for t in 0..geo.tgt_nr() {
            let shard = rot.shard_idx(t);
            prop_assert_eq!(rot.tgt_off(shard), t);
            prop_assert_eq!(rot.is_data_shard(shard), t < geo.k());
        }
    }

    /// Property: single value shares add up and pad the last data cell.
    #[test]
    fn prop_singv_layout(k in 1u32..=16, extra in 1u64..20000) {
        let geo = Geometry::new(k, 2, 16)?;
        let gsize = geo.singv_threshold() + extra;
        let cell = geo.singv_cell_bytes(gsize);
        prop_assume!(gsize > (k as u64 - 1) * cell);

        let mut sum = 0;
        for t in 0..k {
            let loc = geo.singv_local(gsize, t, true)?;
            prop_assert_eq!(loc.size + loc.pad, cell);
            sum += loc.size;
        }
        prop_assert_eq!(sum, gsize);
    }
}

// =============================================================================
// Reassembly Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: scattering each target's fragments rebuilds the user buffer.
    #[test]
    fn prop_fetch_scatter_rebuilds_layout(
        geo in geometry_strategy(),
        recxs in prop::collection::vec(recx_strategy(), 1..4),
        rec_size in 1u64..=4,
    ) {
        let registry = CodecRegistry::builder()
            .register(ObjectClassId(1), "prop", geo)?
            .build()?;
        let class = registry.get(ObjectClassId(1))?;
        let iod = Iod::array("a", rec_size, recxs);
        let len = iod.data_bytes() as usize;
        let user: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let req = reassemble(class, std::slice::from_ref(&iod), &[], false)?;
        let mut out = vec![0u8; len];
        for &tgt in req.targets() {
            let mut reply = Vec::new();
            for frag in req.fragments(0, tgt) {
                let off = frag.user_off as usize;
                reply.extend_from_slice(&user[off..off + (frag.recx.nr * rec_size) as usize]);
            }
            req.scatter_reply(0, tgt, &reply, &mut out)?;
        }
        prop_assert_eq!(out, user);
    }

    /// Property: an update ships every user byte to its data target.
    #[test]
    fn prop_update_bytes_accounted(
        geo in geometry_strategy(),
        recx in recx_strategy(),
    ) {
        let registry = CodecRegistry::builder()
            .register(ObjectClassId(1), "prop", geo)?
            .build()?;
        let class = registry.get(ObjectClassId(1))?;
        let iod = Iod::array("a", 1, vec![recx]);
        let data = Bytes::from(vec![7u8; recx.nr as usize]);
        let req = reassemble(class, &[iod], &[data], true)?;

        let data_bytes: u64 = (0..geo.k())
            .flat_map(|t| req.fragments(0, t))
            .map(|f| f.recx.nr)
            .sum();
        prop_assert_eq!(data_bytes, recx.nr);
        prop_assert!(req.iods[0].recxs.iter().all(|r| !r.is_parity() || geo.p() > 0));
    }
}

// =============================================================================
// Recovery Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: any set of at most p failed targets is rebuilt exactly.
    #[test]
    fn prop_recover_within_parity(
        (k, p) in (1usize..=6, 1usize..=3),
        cell in prop::collection::vec(any::<u8>(), 1..64),
        erasures in erasure_strategy(9, 3),
    ) {
        let total = k + p;
        let errs: Vec<u32> = erasures.into_iter().filter(|&e| (e as usize) < total).collect();
        prop_assume!(errs.len() <= p);

        let geo = Geometry::new(k as u32, p as u32, 1)?;
        let codec = Codec::new(k, p)?;
        let cb = cell.len();

        let data: Vec<Vec<u8>> = (0..k)
            .map(|t| cell.iter().map(|b| b.wrapping_add(t as u8 * 31)).collect())
            .collect();
        let mut parity = vec![vec![0u8; cb]; p];
        {
            let srcs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
            let mut dsts: Vec<&mut [u8]> = parity.iter_mut().map(|d| d.as_mut_slice()).collect();
            codec.encode(&srcs, &mut dsts)?;
        }
        let original: Vec<u8> = data.into_iter().chain(parity).flatten().collect();

        let mut damaged = original.clone();
        for &e in &errs {
            damaged[e as usize * cb..(e as usize + 1) * cb].fill(0xee);
        }
        let rc = RecoveryCodec::build(&geo, &codec, &errs)?;
        rc.recover(&mut damaged, cb)?;

        prop_assert_eq!(&damaged[..k * cb], &original[..k * cb]);
    }

    /// Property: more than p failed targets never yields a codec.
    #[test]
    fn prop_too_many_errors_fail(k in 1u32..=6, p in 0u32..=3) {
        let geo = Geometry::new(k, p, 1)?;
        let codec = Codec::new(k as usize, p as usize)?;
        let errs: Vec<u32> = (0..(p + 1).min(k + p)).collect();
        prop_assert!(RecoveryCodec::build(&geo, &codec, &errs).is_err());
    }
}
