//! Per-shard query dispatch and result merging for the reef document store.
//!
//! The cluster routing layer restricts each operation to the region a shard
//! owns (`protocol::Read::shard` and friends), executes it against the
//! local ordered engine (`store::Store`), and merges the per-shard
//! responses back into one logical response (`unshard` /
//! `multistore_unshard`). Backfill streams a region's contents between
//! replicas as chunks. Higher layers supply the slice, the transaction and
//! superblock tokens, and the cluster context; this crate owns none of
//! them.

pub mod btree;
pub mod context;
pub mod protocol;
pub mod ql;
pub mod region;
pub mod store;

pub use btree::{BtreeSlice, FjallSlice, MemBtree, RepliTimestamp, Superblock, Transaction};
pub use context::{Context, Interrupted, MachineId};
pub use protocol::{
    BackfillChunk, Read, ReadResponse, Write, WriteResponse, PROTOCOL_NAME,
};
pub use region::{cpu_sharding_subspace, monokey_region, KeyRange, Region};
pub use store::{BackfillProgress, ChunkSink, Store};
