//! Extents and Parity Address Space
//!
//! A [`Recx`] is a contiguous run of records. The most significant bit of its
//! index selects the private parity address range; user extents never carry
//! it. [`SpacedRecx`] carries the same information as a tag so code past the
//! ingress boundary does not have to inspect raw bits.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Bit marking an index as belonging to the parity address range
pub const PARITY_INDICATOR: u64 = 1 << 63;

// =============================================================================
// Recx
// =============================================================================

/// Contiguous record extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Recx {
    /// First record index
    pub idx: u64,
    /// Number of records
    pub nr: u64,
}

impl Recx {
    pub const fn new(idx: u64, nr: u64) -> Self {
        Self { idx, nr }
    }

    /// One past the last record
    #[inline]
    pub fn end(&self) -> u64 {
        self.idx + self.nr
    }

    /// Whether `other` lies entirely inside this extent
    #[inline]
    pub fn covers(&self, other: &Recx) -> bool {
        self.idx <= other.idx && other.end() <= self.end()
    }

    /// Whether the two extents share at least one record
    #[inline]
    pub fn overlaps(&self, other: &Recx) -> bool {
        self.idx < other.end() && other.idx < self.end()
    }

    /// Intersection of two extents, if any
    pub fn intersect(&self, other: &Recx) -> Option<Recx> {
        let idx = self.idx.max(other.idx);
        let end = self.end().min(other.end());
        (idx < end).then(|| Recx::new(idx, end - idx))
    }

    /// Whether the index carries the parity indicator
    #[inline]
    pub fn is_parity(&self) -> bool {
        self.idx & PARITY_INDICATOR != 0
    }

    /// Validate an extent arriving from a client
    ///
    /// User extents must be non-empty, must not carry the parity indicator
    /// and must not run into the parity range.
    pub fn validate_user(&self) -> Result<()> {
        if self.nr == 0 {
            return Err(Error::InvalidArgument(format!("empty extent {}", self)));
        }
        if self.is_parity() {
            return Err(Error::InvalidArgument(format!(
                "extent {} uses the reserved parity range",
                self
            )));
        }
        match self.idx.checked_add(self.nr) {
            Some(end) if end <= PARITY_INDICATOR => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "extent {} overflows the user address range",
                self
            ))),
        }
    }
}

impl fmt::Display for Recx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_parity() {
            write!(f, "[P{}, {}]", self.idx & !PARITY_INDICATOR, self.nr)
        } else {
            write!(f, "[{}, {}]", self.idx, self.nr)
        }
    }
}

/// Set the parity indicator on an index
///
/// Setting it twice is a caller bug and reported as such.
pub fn set_parity(idx: u64) -> Result<u64> {
    if idx & PARITY_INDICATOR != 0 {
        return Err(Error::InvalidArgument(format!(
            "parity indicator already set on {:#x}",
            idx
        )));
    }
    Ok(idx | PARITY_INDICATOR)
}

/// Clear the parity indicator on an index
pub fn clear_parity(idx: u64) -> Result<u64> {
    if idx & PARITY_INDICATOR == 0 {
        return Err(Error::InvalidArgument(format!(
            "parity indicator not set on {:#x}",
            idx
        )));
    }
    Ok(idx & !PARITY_INDICATOR)
}

// =============================================================================
// Tagged Address Space
// =============================================================================

/// Address range an extent belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrSpace {
    /// User data, mapped or unmapped
    Data,
    /// Private parity range
    Parity,
}

/// Extent tagged with its address space; the inner index never has the
/// parity indicator set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpacedRecx {
    Data(Recx),
    Parity(Recx),
}

impl SpacedRecx {
    /// Decode a raw extent, moving the indicator bit into the tag
    pub fn from_raw(raw: Recx) -> Self {
        if raw.is_parity() {
            SpacedRecx::Parity(Recx::new(raw.idx & !PARITY_INDICATOR, raw.nr))
        } else {
            SpacedRecx::Data(raw)
        }
    }

    /// Encode back to a raw extent
    pub fn into_raw(self) -> Result<Recx> {
        match self {
            SpacedRecx::Data(r) => {
                if r.is_parity() {
                    return Err(Error::InvalidArgument(format!(
                        "data extent {} carries the parity indicator",
                        r
                    )));
                }
                Ok(r)
            }
            SpacedRecx::Parity(r) => Ok(Recx::new(set_parity(r.idx)?, r.nr)),
        }
    }

    pub fn space(&self) -> AddrSpace {
        match self {
            SpacedRecx::Data(_) => AddrSpace::Data,
            SpacedRecx::Parity(_) => AddrSpace::Parity,
        }
    }

    /// The extent with the tag stripped
    pub fn recx(&self) -> Recx {
        match self {
            SpacedRecx::Data(r) | SpacedRecx::Parity(r) => *r,
        }
    }
}

// =============================================================================
// Recx-Epoch Lists
// =============================================================================

/// Extent with the epoch it was written at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecxEp {
    pub recx: Recx,
    pub epoch: u64,
    pub rec_size: u64,
}

/// Ordered list of extents and epochs reported by one target for one IOD
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecxEpList {
    pub items: Vec<RecxEp>,
    /// Whether the epochs in `items` are meaningful
    pub ep_valid: bool,
}

impl RecxEpList {
    pub fn new(ep_valid: bool) -> Self {
        Self {
            items: Vec::new(),
            ep_valid,
        }
    }

    pub fn push(&mut self, recx: Recx, epoch: u64, rec_size: u64) {
        self.items.push(RecxEp {
            recx,
            epoch,
            rec_size,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether every item of this list lies inside some item of `other`
    ///
    /// Two lists are never covered when either is empty or a record size
    /// differs.
    pub fn covered_by(&self, other: &RecxEpList) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.items.iter().all(|mine| {
            other
                .items
                .iter()
                .any(|theirs| theirs.rec_size == mine.rec_size && theirs.recx.covers(&mine.recx))
        })
    }

    fn rec_size_conflict(&self, other: &RecxEpList) -> Option<(u64, u64)> {
        self.items.iter().find_map(|mine| {
            other
                .items
                .iter()
                .find(|theirs| theirs.rec_size != mine.rec_size)
                .map(|theirs| (mine.rec_size, theirs.rec_size))
        })
    }
}

/// Reconcile two targets' parity reports, one list per IOD
///
/// Identical reports match. Reports whose ranges differ but where one
/// contains the other come from a write racing the fetch and yield
/// [`Error::FetchAgain`], as do identical ranges written at different
/// epochs. Anything else is [`Error::DataLoss`].
pub fn parity_lists_match(a: &[RecxEpList], b: &[RecxEpList]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::InvalidArgument(format!(
            "comparing {} parity lists against {}",
            a.len(),
            b.len()
        )));
    }

    for (i, (la, lb)) in a.iter().zip(b).enumerate() {
        if la.ep_valid != lb.ep_valid {
            return Err(Error::DataLoss(format!(
                "iod {}: parity lists disagree on epoch validity",
                i
            )));
        }
        if let Some((x, y)) = la.rec_size_conflict(lb) {
            return Err(Error::DataLoss(format!(
                "iod {}: parity record size {} vs {}",
                i, x, y
            )));
        }
        if la.len() != lb.len() {
            if la.covered_by(lb) || lb.covered_by(la) {
                return Err(Error::FetchAgain(format!(
                    "iod {}: parity lists differ but one covers the other",
                    i
                )));
            }
            return Err(Error::DataLoss(format!(
                "iod {}: {} vs {} parity extents with no containment",
                i,
                la.len(),
                lb.len()
            )));
        }
        for (x, y) in la.items.iter().zip(&lb.items) {
            if x.recx != y.recx {
                return Err(Error::DataLoss(format!(
                    "iod {}: parity extent {} vs {}",
                    i, x.recx, y.recx
                )));
            }
            if x.epoch != y.epoch {
                return Err(Error::FetchAgain(format!(
                    "iod {}: parity extent {} at epoch {} vs {}",
                    i, x.recx, x.epoch, y.epoch
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn list(items: &[(u64, u64, u64)]) -> RecxEpList {
        let mut l = RecxEpList::new(true);
        for &(idx, nr, ep) in items {
            l.push(Recx::new(idx, nr), ep, 8);
        }
        l
    }

    #[test]
    fn test_recx_basics() {
        let r = Recx::new(10, 20);
        assert_eq!(r.end(), 30);
        assert!(r.covers(&Recx::new(10, 20)));
        assert!(r.covers(&Recx::new(15, 5)));
        assert!(!r.covers(&Recx::new(25, 10)));
        assert!(r.overlaps(&Recx::new(29, 5)));
        assert!(!r.overlaps(&Recx::new(30, 5)));
        assert_eq!(r.intersect(&Recx::new(25, 10)), Some(Recx::new(25, 5)));
        assert_eq!(r.intersect(&Recx::new(0, 10)), None);
    }

    #[test]
    fn test_validate_user() {
        assert!(Recx::new(0, 1).validate_user().is_ok());
        assert_matches!(
            Recx::new(0, 0).validate_user(),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Recx::new(PARITY_INDICATOR | 4, 1).validate_user(),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            Recx::new(PARITY_INDICATOR - 1, 2).validate_user(),
            Err(Error::InvalidArgument(_))
        );
        assert!(Recx::new(PARITY_INDICATOR - 1, 1).validate_user().is_ok());
    }

    #[test]
    fn test_parity_indicator_misuse() {
        let idx = set_parity(42).unwrap();
        assert_eq!(idx, 42 | PARITY_INDICATOR);
        assert_matches!(set_parity(idx), Err(Error::InvalidArgument(_)));
        assert_eq!(clear_parity(idx).unwrap(), 42);
        assert_matches!(clear_parity(42), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_spaced_recx() {
        let raw = Recx::new(PARITY_INDICATOR | 64, 16);
        let spaced = SpacedRecx::from_raw(raw);
        assert_eq!(spaced, SpacedRecx::Parity(Recx::new(64, 16)));
        assert_eq!(spaced.space(), AddrSpace::Parity);
        assert_eq!(spaced.into_raw().unwrap(), raw);

        let data = SpacedRecx::from_raw(Recx::new(3, 4));
        assert_eq!(data.space(), AddrSpace::Data);
        assert_eq!(data.recx(), Recx::new(3, 4));

        assert!(SpacedRecx::Data(raw).into_raw().is_err());
        assert!(SpacedRecx::Parity(raw).into_raw().is_err());
    }

    #[test]
    fn test_lists_match_identical() {
        let a = vec![list(&[(0, 64, 5), (128, 64, 7)]), RecxEpList::new(true)];
        assert!(parity_lists_match(&a, &a.clone()).is_ok());
    }

    #[test]
    fn test_lists_match_contained_is_race() {
        let a = vec![list(&[(0, 128, 5)])];
        let b = vec![list(&[(0, 64, 5), (64, 64, 6)])];
        assert_matches!(parity_lists_match(&a, &b), Err(Error::FetchAgain(_)));
        assert_matches!(parity_lists_match(&b, &a), Err(Error::FetchAgain(_)));
    }

    #[test]
    fn test_lists_match_epoch_race() {
        let a = vec![list(&[(0, 64, 5)])];
        let b = vec![list(&[(0, 64, 9)])];
        assert_matches!(parity_lists_match(&a, &b), Err(Error::FetchAgain(_)));
    }

    #[test]
    fn test_lists_match_divergent_is_loss() {
        let a = vec![list(&[(0, 64, 5)])];
        let b = vec![list(&[(0, 32, 5), (128, 64, 5)])];
        assert_matches!(parity_lists_match(&a, &b), Err(Error::DataLoss(_)));

        let c = vec![list(&[(64, 64, 5)])];
        assert_matches!(parity_lists_match(&a, &c), Err(Error::DataLoss(_)));
    }

    #[test]
    fn test_lists_match_rec_size_is_loss() {
        let a = vec![list(&[(0, 64, 5)])];
        let mut b = vec![RecxEpList::new(true)];
        b[0].push(Recx::new(0, 64), 5, 16);
        assert_matches!(parity_lists_match(&a, &b), Err(Error::DataLoss(_)));
    }

    #[test]
    fn test_lists_match_ep_valid() {
        let a = vec![list(&[(0, 64, 5)])];
        let mut b = a.clone();
        b[0].ep_valid = false;
        assert_matches!(parity_lists_match(&a, &b), Err(Error::DataLoss(_)));
        assert_matches!(
            parity_lists_match(&a, &[]),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_covered_by_empty() {
        let a = list(&[(0, 64, 1)]);
        assert!(!a.covered_by(&RecxEpList::new(true)));
        assert!(!RecxEpList::new(true).covered_by(&a));
    }
}
