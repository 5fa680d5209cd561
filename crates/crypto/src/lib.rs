//! # Meridian Crypto
//!
//! Cryptographic primitives for the Meridian node.
//!
//! This crate provides:
//! - **EllipticSum** - an incrementally updatable, order-independent state
//!   checksum built from homomorphic addition of Ristretto255 points
//!
//! ## Example
//!
//! ```rust,ignore
//! use meridian_crypto::EllipticSum;
//!
//! let checksum = EllipticSum::new();
//! checksum.add(b"record".to_vec()).await?;
//! let digest = checksum.to_bytes().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod elliptic_sum;

// Re-export commonly used items
pub use elliptic_sum::{hash_to_point, EllipticSum, ELLIPTIC_SUM_DST};

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// A worker slot could not be acquired (pool shut down mid-operation)
    #[error("checksum worker pool is shut down")]
    Scheduling,
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, ChecksumError>;
