//! The wide-column data model: partition keys ordered by token, clusterings
//! with bound/boundary kinds, and partition updates that merge by
//! last-write-wins reconciliation.

pub mod clustering;
pub mod key;
pub mod mutation;
pub mod update;

pub use clustering::{Clustering, ClusteringKind};
pub use key::{HashPartitioner, PartitionKey, Partitioner, Token};
pub use mutation::Mutation;
pub use update::{
    Cell, ColumnId, DeletionTime, PartitionUpdate, PutDelta, RangeTombstone, Row, Timestamp,
};
