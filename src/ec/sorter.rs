//! Segment Sorter
//!
//! Buckets fragments by target in a single pass. Within a target fragments
//! keep their insertion order, which is the order of the originating extent
//! list, so concatenating the buckets in target order yields the reassembled
//! layout.

use crate::error::{try_alloc, Error, Result};

/// Per-target fragment buckets with a known total
#[derive(Debug)]
pub struct SegmentSorter<T> {
    tgts: Vec<Vec<T>>,
    seg_nr: usize,
    seg_total: usize,
}

impl<T> SegmentSorter<T> {
    /// Create a sorter for `tgt_nr` targets expecting `seg_total` fragments
    pub fn new(tgt_nr: usize, seg_total: usize) -> Result<Self> {
        let mut tgts = try_alloc(tgt_nr, "segment sorter")?;
        tgts.resize_with(tgt_nr, Vec::new);
        Ok(Self {
            tgts,
            seg_nr: 0,
            seg_total,
        })
    }

    /// Append a fragment to a target's bucket
    pub fn insert(&mut self, tgt: u32, seg: T) -> Result<()> {
        if self.seg_nr >= self.seg_total {
            return Err(Error::Internal(format!(
                "segment sorter overflow, expected {} segments",
                self.seg_total
            )));
        }
        let bucket = self.tgts.get_mut(tgt as usize).ok_or_else(|| {
            Error::InvalidArgument(format!("segment for unknown target {}", tgt))
        })?;
        bucket.push(seg);
        self.seg_nr += 1;
        Ok(())
    }

    /// Number of fragments held for a target
    pub fn tgt_seg_nr(&self, tgt: u32) -> usize {
        self.tgts.get(tgt as usize).map_or(0, Vec::len)
    }

    /// Fragments held for a target, in insertion order
    pub fn segs(&self, tgt: u32) -> &[T] {
        self.tgts
            .get(tgt as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn seg_nr(&self) -> usize {
        self.seg_nr
    }

    /// Consume the sorter, returning every bucket
    ///
    /// A fragment count different from the announced total means some
    /// fragment was dropped or duplicated on the way.
    pub fn finish(self) -> Result<Vec<Vec<T>>> {
        if self.seg_nr != self.seg_total {
            return Err(Error::DataLoss(format!(
                "sorted {} segments, expected {}",
                self.seg_nr, self.seg_total
            )));
        }
        Ok(self.tgts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_sorter_buckets_in_order() {
        let mut sorter = SegmentSorter::new(3, 5).unwrap();
        sorter.insert(2, "c0").unwrap();
        sorter.insert(0, "a0").unwrap();
        sorter.insert(2, "c1").unwrap();
        sorter.insert(0, "a1").unwrap();
        sorter.insert(1, "b0").unwrap();

        assert_eq!(sorter.tgt_seg_nr(0), 2);
        assert_eq!(sorter.segs(2), &["c0", "c1"]);
        assert_eq!(sorter.tgt_seg_nr(7), 0);

        let buckets = sorter.finish().unwrap();
        let flat: Vec<_> = buckets.into_iter().flatten().collect();
        assert_eq!(flat, vec!["a0", "a1", "b0", "c0", "c1"]);
    }

    #[test]
    fn test_sorter_short_count_is_data_loss() {
        let mut sorter = SegmentSorter::new(2, 3).unwrap();
        sorter.insert(0, 1u32).unwrap();
        sorter.insert(1, 2u32).unwrap();
        assert_matches!(sorter.finish(), Err(Error::DataLoss(_)));
    }

    #[test]
    fn test_sorter_rejects_bad_insert() {
        let mut sorter = SegmentSorter::new(2, 1).unwrap();
        assert_matches!(sorter.insert(5, ()), Err(Error::InvalidArgument(_)));
        sorter.insert(0, ()).unwrap();
        assert!(sorter.insert(1, ()).is_err());
        assert_eq!(sorter.seg_nr(), 1);
    }
}
