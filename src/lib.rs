//! Tephra: a per-table wide-column storage engine.
//!
//! The write path accepts partition-update mutations, serves them from a
//! sorted in-memory buffer immediately, and persists them to immutable
//! sorted files under a strict ordering contract with an external commit
//! log, so crash recovery is lossless. Background compaction merges files;
//! reads lazily merge every live source; file swaps are crash-safe through
//! on-disk lifecycle transactions.
//!
//! ```text
//!          writes                    reads
//!            │                         │
//!            ▼                         ▼
//!      ┌──────────┐ switch  ┌─────────────────────┐
//!      │ memtable │────────▶│ tracker view        │
//!      └──────────┘         │  current memtable   │
//!            │              │  flushing memtables │
//!       flush│barrier       │  live sorted files  │
//!            ▼              └─────────────────────┘
//!      ┌──────────┐   lifecycle txn      ▲
//!      │  sorted  │──────────────────────┘
//!      │  files   │◀──── compaction ─────┐
//!      └──────────┘                      │
//! ```

pub mod cache;
pub mod commitlog;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod flock;
pub mod flush;
pub mod lifecycle;
pub mod memtable;
pub mod metrics;
pub mod oporder;
pub mod partition;
pub mod read;
pub mod scheduler;
pub mod schema;
pub mod sstable;
pub mod table;
pub mod testdir;
pub mod tracker;

pub use commitlog::{CommitLog, MemoryLog, ReplayPosition};
pub use config::{EngineConfig, TableParams};
pub use engine::{Engine, EngineContext};
pub use error::{Error, Result};
pub use flush::{FlushHandle, FlushReason};
pub use partition::{Clustering, Mutation, PartitionKey, PartitionUpdate};
pub use read::{ReadCommand, ReadPartition};
pub use schema::{TableId, TableSchema};
pub use table::TableStore;
