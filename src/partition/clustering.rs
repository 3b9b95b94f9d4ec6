use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a clustering prefix stands for: a concrete row, the partition's
/// static row, or the edge of a deleted range. Boundaries are the fusion of
/// an end and a start at the same position, produced when two deleted
/// ranges abut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusteringKind {
    ExclEndBound,
    InclStartBound,
    ExclEndInclStartBoundary,
    StaticRow,
    Row,
    InclEndExclStartBoundary,
    InclEndBound,
    ExclStartBound,
}

impl ClusteringKind {
    /// Sort rank among kinds sharing the same prefix values. Kinds with the
    /// same rank compare equal at the same position.
    fn comparison_rank(self) -> u8 {
        match self {
            ClusteringKind::ExclEndBound
            | ClusteringKind::InclStartBound
            | ClusteringKind::ExclEndInclStartBoundary => 0,
            ClusteringKind::StaticRow => 1,
            ClusteringKind::Row => 2,
            ClusteringKind::InclEndExclStartBoundary
            | ClusteringKind::InclEndBound
            | ClusteringKind::ExclStartBound => 3,
        }
    }

    /// How a prefix of this kind compares against a longer row it is a
    /// strict prefix of: -1 sorts before, +1 after.
    fn compared_to_row(self) -> i8 {
        match self.comparison_rank() {
            0 | 1 => -1,
            2 => 0,
            _ => 1,
        }
    }

    pub fn is_bound(self) -> bool {
        matches!(
            self,
            ClusteringKind::InclStartBound
                | ClusteringKind::ExclStartBound
                | ClusteringKind::InclEndBound
                | ClusteringKind::ExclEndBound
        )
    }

    pub fn is_boundary(self) -> bool {
        matches!(
            self,
            ClusteringKind::ExclEndInclStartBoundary | ClusteringKind::InclEndExclStartBoundary
        )
    }

    /// True if a range starting here admits a row at the same position.
    pub fn is_inclusive_start(self) -> bool {
        matches!(
            self,
            ClusteringKind::InclStartBound | ClusteringKind::ExclEndInclStartBoundary
        )
    }

    /// True if a range ending here admits a row at the same position.
    pub fn is_inclusive_end(self) -> bool {
        matches!(
            self,
            ClusteringKind::InclEndBound | ClusteringKind::InclEndExclStartBoundary
        )
    }
}

/// The sort key within a partition: an ordered tuple of serialized values
/// plus a kind tag. Bounds order correctly against the rows they bracket;
/// a boundary sits exactly where the end it carries does.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clustering {
    kind: ClusteringKind,
    values: Vec<Vec<u8>>,
}

impl Clustering {
    pub fn row(values: Vec<Vec<u8>>) -> Self {
        Self {
            kind: ClusteringKind::Row,
            values,
        }
    }

    pub fn static_row() -> Self {
        Self {
            kind: ClusteringKind::StaticRow,
            values: Vec::new(),
        }
    }

    pub fn bound(kind: ClusteringKind, values: Vec<Vec<u8>>) -> Self {
        debug_assert!(kind.is_bound() || kind.is_boundary());
        Self { kind, values }
    }

    /// The open start of a partition-wide slice.
    pub fn bottom() -> Self {
        Self::bound(ClusteringKind::InclStartBound, Vec::new())
    }

    /// The open end of a partition-wide slice.
    pub fn top() -> Self {
        Self::bound(ClusteringKind::InclEndBound, Vec::new())
    }

    pub fn kind(&self) -> ClusteringKind {
        self.kind
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn is_static(&self) -> bool {
        self.kind == ClusteringKind::StaticRow
    }

    pub fn serialized_size(&self) -> usize {
        1 + self.values.iter().map(|v| 4 + v.len()).sum::<usize>()
    }
}

impl fmt::Debug for Clustering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:02x?}", self.kind, self.values)
    }
}

impl PartialOrd for Clustering {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Clustering {
    fn cmp(&self, other: &Self) -> Ordering {
        // Static rows sort before every other prefix in the partition.
        match (self.is_static(), other.is_static()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }

        let shared = self.values.len().min(other.values.len());
        for i in 0..shared {
            match self.values[i].cmp(&other.values[i]) {
                Ordering::Equal => {}
                other => return other,
            }
        }

        match self.values.len().cmp(&other.values.len()) {
            Ordering::Equal => self
                .kind
                .comparison_rank()
                .cmp(&other.kind.comparison_rank()),
            Ordering::Less => {
                // Self is a strict prefix: its kind decides which side of the
                // longer prefix it falls on.
                match self.kind.compared_to_row() {
                    0 => Ordering::Less,
                    n if n < 0 => Ordering::Less,
                    _ => Ordering::Greater,
                }
            }
            Ordering::Greater => match other.kind.compared_to_row() {
                0 => Ordering::Greater,
                n if n < 0 => Ordering::Greater,
                _ => Ordering::Less,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: &[&[u8]]) -> Clustering {
        Clustering::row(vals.iter().map(|v| v.to_vec()).collect())
    }

    fn bound(kind: ClusteringKind, vals: &[&[u8]]) -> Clustering {
        Clustering::bound(kind, vals.iter().map(|v| v.to_vec()).collect())
    }

    #[test]
    fn test_rows_sort_by_values() {
        assert!(row(&[b"a"]) < row(&[b"b"]));
        assert!(row(&[b"a", b"1"]) < row(&[b"a", b"2"]));
    }

    #[test]
    fn test_static_sorts_first() {
        assert!(Clustering::static_row() < row(&[b""]));
        assert!(Clustering::static_row() < bound(ClusteringKind::InclStartBound, &[]));
    }

    #[test]
    fn test_bounds_bracket_rows() {
        let r = row(&[b"m"]);

        assert!(bound(ClusteringKind::InclStartBound, &[b"m"]) < r);
        assert!(bound(ClusteringKind::ExclEndBound, &[b"m"]) < r);
        assert!(bound(ClusteringKind::InclEndBound, &[b"m"]) > r);
        assert!(bound(ClusteringKind::ExclStartBound, &[b"m"]) > r);
    }

    #[test]
    fn test_boundary_sits_between() {
        let r = row(&[b"m"]);
        // An end-inclusive boundary admits the row on its left side.
        assert!(bound(ClusteringKind::InclEndExclStartBoundary, &[b"m"]) > r);
        assert!(bound(ClusteringKind::ExclEndInclStartBoundary, &[b"m"]) < r);
    }

    #[test]
    fn test_prefix_bounds() {
        // A start bound on ("a") opens before every ("a", ...) row.
        let start = bound(ClusteringKind::InclStartBound, &[b"a"]);
        let end = bound(ClusteringKind::InclEndBound, &[b"a"]);
        let inner = row(&[b"a", b"x"]);

        assert!(start < inner);
        assert!(end > inner);
    }

    #[test]
    fn test_partition_wide_slice() {
        let r = row(&[b"anything"]);
        assert!(Clustering::bottom() < r);
        assert!(Clustering::top() > r);
    }
}
