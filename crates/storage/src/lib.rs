//! Meridian Storage Layer
//!
//! This crate provides the embedded storage infrastructure shared by the
//! Meridian node:
//!
//! - **Database**: RocksDB wrapper exposing the ordered key-value contract the
//!   node relies on: point reads, atomic write batches, read-your-writes
//!   update transactions, bounded prefix iteration and prefix drops
//! - **DbEntry**: the key-value record representation and its varint-framed
//!   wire encoding, shared between on-disk scans and the sync protocol

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod db;
pub mod entry;

// Re-exports for convenience
pub use db::{Database, DatabaseConfig, UpdateTxn, WriteBatch};
pub use entry::{read_uvarint, write_uvarint, DbEntry};

use thiserror::Error;

/// Storage error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Key not found
    #[error("key not found")]
    KeyNotFound,

    /// Malformed record or wire data
    #[error("encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;
