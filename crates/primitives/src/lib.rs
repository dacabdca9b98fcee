//! Scalar identifier types shared by every region layout.
//!
//! All of these are `bytemuck::Pod` so they can be embedded directly in the
//! fixed-layout records that live inside memory-mapped regions. Sentinel
//! values are part of the on-disk format: a [`Tid`] of `Tid::MAX` means
//! "no transaction", a [`RowId`] of `-1` means "no row".

use core::fmt;

use bytemuck::{Pod, Zeroable};

/// A transaction identifier. Monotonically assigned, never reused within the
/// lifetime of a fileset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Tid(pub u64);

impl Tid {
    /// The first transaction id of a fresh fileset.
    pub const MIN: Tid = Tid(0);
    /// Sentinel: "no transaction" / invalid.
    pub const MAX: Tid = Tid(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::MAX
    }
}

impl From<u64> for Tid {
    fn from(raw: u64) -> Self {
        Tid(raw)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("-")
        }
    }
}

/// A transaction commit counter value. Advanced on every commit; snapshots
/// capture the counter at statement or transaction begin.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Tcc(pub u64);

impl Tcc {
    pub const MIN: Tcc = Tcc(0);
    pub const MAX: Tcc = Tcc(u64::MAX);
}

impl From<u64> for Tcc {
    fn from(raw: u64) -> Self {
        Tcc(raw)
    }
}

impl fmt::Display for Tcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The index of a row slot within one entity region.
///
/// Signed so that `-1` can serve as the in-region "no row" pointer, e.g. for
/// absent treap children and unpublished index roots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct RowId(pub i64);

impl RowId {
    /// Sentinel: "no row".
    pub const INVALID: RowId = RowId(-1);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The slot index this id refers to. Callers must check `is_valid` first.
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl From<i64> for RowId {
    fn from(raw: i64) -> Self {
        RowId(raw)
    }
}

impl From<usize> for RowId {
    fn from(idx: usize) -> Self {
        RowId(idx as i64)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum number of name bytes a [`FixedName`] can hold, excluding the
/// terminating NUL that the cell always reserves.
pub const NAME_MAX_LEN: usize = 63;

/// A NUL-padded fixed-width name cell, as stored in region headers and
/// catalog rows. Comparison and ordering use the trimmed string so that the
/// padding never participates in index order.
#[derive(Copy, Clone, Pod, Zeroable)]
#[repr(transparent)]
pub struct FixedName([u8; 64]);

impl FixedName {
    pub const EMPTY: FixedName = FixedName([0; 64]);

    /// Builds a name cell from `name`. Returns `None` when `name` does not
    /// fit in 63 bytes or contains a NUL.
    pub fn new(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_MAX_LEN || bytes.contains(&0) {
            return None;
        }
        let mut buf = [0u8; 64];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(FixedName(buf))
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        // The cell is only ever written from `&str` input.
        core::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl PartialEq for FixedName {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for FixedName {}

impl PartialOrd for FixedName {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FixedName {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialEq<str> for FixedName {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl fmt::Debug for FixedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for FixedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_sentinels() {
        assert!(Tid::MIN.is_valid());
        assert!(!Tid::MAX.is_valid());
        assert!(Tid(42).is_valid());
        assert_eq!(Tid::MAX.to_string(), "-");
    }

    #[test]
    fn rowid_sentinels() {
        assert!(!RowId::INVALID.is_valid());
        assert!(RowId(0).is_valid());
        assert_eq!(RowId::from(7usize), RowId(7));
        assert_eq!(RowId(9).idx(), 9);
    }

    #[test]
    fn fixed_name_round_trip() {
        let name = FixedName::new("EntityMaster").unwrap();
        assert_eq!(name.as_str(), "EntityMaster");
        assert_eq!(name, *"EntityMaster");
        assert!(!name.is_empty());
        assert!(FixedName::EMPTY.is_empty());
    }

    #[test]
    fn fixed_name_rejects_oversize() {
        let long = "x".repeat(NAME_MAX_LEN + 1);
        assert!(FixedName::new(&long).is_none());
        let fits = "x".repeat(NAME_MAX_LEN);
        assert!(FixedName::new(&fits).is_some());
        assert!(FixedName::new("nul\0name").is_none());
    }

    #[test]
    fn fixed_name_orders_by_trimmed_string() {
        let a = FixedName::new("AAAAA").unwrap();
        let b = FixedName::new("AAAAB").unwrap();
        assert!(a < b);
    }

    proptest::proptest! {
        #[test]
        fn fixed_name_round_trips_any_short_name(name in "[a-zA-Z0-9_]{1,63}") {
            let cell = FixedName::new(&name).unwrap();
            proptest::prop_assert_eq!(cell.as_str(), name.as_str());
        }

        #[test]
        fn fixed_name_order_agrees_with_str_order(a in "[a-z]{1,16}", b in "[a-z]{1,16}") {
            let fa = FixedName::new(&a).unwrap();
            let fb = FixedName::new(&b).unwrap();
            proptest::prop_assert_eq!(fa.cmp(&fb), a.cmp(&b));
        }
    }
}
