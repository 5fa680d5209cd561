//! # Meridian State Sync
//!
//! This crate is the core of hyper-sync: fast state synchronization that lets
//! a joining node download a consistent snapshot of the key-value state at a
//! past block height instead of replaying the whole chain, and verify it
//! against a compact checksum agreed by the network.
//!
//! ## Key Components
//!
//! - **[`SnapshotEngine`]**: owns the ancestral records database, the
//!   [`EllipticSum`](meridian_crypto::EllipticSum) checksum and the snapshot
//!   epoch state, and serializes every mutation through a single dispatcher
//!   task.
//!
//! - **[`AncestralCache`]**: per-batch staging buffer of pre-images, filled by
//!   the mutation-preparation path and drained by the dispatcher's flush.
//!
//! - **Chunk server / ingester** (`chunks`): serves lexicographic slices of
//!   the snapshot-height database by merging the live database with the
//!   ancestral records on the fly, and applies chunks received from peers.
//!
//! ## Snapshot Epochs
//!
//! Snapshots exist at block heights `0, P, 2P, …` where `P` is the epoch
//! period. Cloning the database at each boundary would cost minutes of
//! downtime on an unbounded state, so the engine instead accumulates
//! *ancestral records*: the previous value of every key modified during the
//! current epoch. The live database combined with the ancestral records
//! reconstructs the database exactly as it stood at the last snapshot height,
//! without ever pausing the node.
//!
//! ## Concurrency Model
//!
//! Producers (the view layer, the block processor, chunk RPC handlers)
//! enqueue operations onto a bounded channel; one dispatcher task applies
//! them in order, so the checksum, the ancestral database and the epoch state
//! stay mutually consistent without producer-side locking. Chunk serving
//! reads both databases without locks and detects races with in-flight
//! flushes through a pair of generation counters.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod chunks;
pub mod engine;
pub mod records;

// Re-export main types at crate root
pub use cache::{AncestralCache, AncestralValue};
pub use chunks::{ChunkFetch, SnapshotChunk};
pub use engine::{EpochState, SnapshotConfig, SnapshotEngine};

use meridian_crypto::ChecksumError;
use meridian_storage::StoreError;
use thiserror::Error;

/// A 32-byte hash type used throughout the state sync layer
pub type Hash = [u8; 32];

/// Maximum number of entries in a single snapshot chunk
pub const SNAPSHOT_BATCH_SIZE: usize = 1000;

/// Default number of blocks between snapshot epochs
pub const DEFAULT_EPOCH_PERIOD: u64 = 1000;

/// Capacity of the dispatcher's operation channel
pub const OPERATION_CHANNEL_CAPACITY: usize = 10_000;

/// Errors surfaced by the snapshot engine
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A record was prepared with no ancestral cache open
    #[error("no ancestral cache is open; call prepare_ancestral_flush first")]
    CacheMissing,

    /// The tail cache does not belong to the current flush
    #[error("tail ancestral cache id {cache_id} does not match flush counter {flush_counter}")]
    CacheIdMismatch {
        /// Id of the cache found at the tail of the queue
        cache_id: u64,
        /// Value of the engine's flush counter
        flush_counter: u64,
    },

    /// A persisted ancestral record could not be interpreted
    #[error("corrupt ancestral record: {0}")]
    Encoding(String),

    /// Failure in the embedded key-value store
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Failure scheduling checksum work
    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    /// The engine has been stopped and accepts no further operations
    #[error("snapshot engine is stopped")]
    Stopped,
}

/// Result type for state sync operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
