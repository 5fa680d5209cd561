//! # EllipticSum state checksum
//!
//! EllipticSum verifies integrity of state data. When syncing state from
//! peers, both sides need to agree that they hold the same copy of the
//! database. Merkle trees answer that question at O(log n) per update and
//! O(n) space; EllipticSum instead maintains a single elliptic-curve point at
//! O(1) time and space per update.
//!
//! For a multiset S of byte strings the checksum is `Σ H(s) for s in S`,
//! where H is a hash-to-curve map into the Ristretto255 group. Finding a
//! different multiset with the same sum reduces to the discrete-log problem
//! in the group, giving ~126 bits of security. Because the group is abelian,
//! updates commute: the checksum converges to the same point no matter the
//! order in which records are added or removed, which is what lets updates
//! run concurrently.
//!
//! ## Concurrency
//!
//! Hashing to the curve is 2-3 orders of magnitude more expensive than point
//! addition, so `add`/`remove` fan the hash out to a bounded worker pool and
//! fold the resulting point into the accumulator under a short mutex. The
//! pool is a counting semaphore sized to the number of hardware threads;
//! `wait`/`snapshot` drain it by acquiring every slot at once.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::traits::Identity;
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::{ChecksumError, Result};

/// Domain-separation tag mixed into every hash-to-curve call.
///
/// Part of the peer protocol: changing it invalidates every checksum on the
/// network.
pub const ELLIPTIC_SUM_DST: &[u8] = b"MERIDIAN-ELLIPTIC-SUM:Ristretto255";

/// Size in bytes of the canonical compressed checksum encoding.
pub const CHECKSUM_BYTES: usize = 32;

/// Hash arbitrary data to a Ristretto255 point.
///
/// The input is domain-separated with [`ELLIPTIC_SUM_DST`], widened to 64
/// uniform bytes with SHA-512 and mapped onto the curve. The map is one-way:
/// it reveals no discrete-log relation between outputs.
pub fn hash_to_point(data: &[u8]) -> RistrettoPoint {
    let mut hasher = Sha512::new();
    hasher.update(ELLIPTIC_SUM_DST);
    hasher.update(data);
    RistrettoPoint::from_uniform_bytes(&hasher.finalize().into())
}

/// Order-independent state checksum over Ristretto255.
pub struct EllipticSum {
    /// Sum of the points of every record currently in the state.
    acc: Arc<Mutex<RistrettoPoint>>,
    /// Worker pool admission; one permit per in-flight hash-to-curve.
    workers: Arc<Semaphore>,
    /// Pool size; acquiring this many permits drains the pool.
    max_workers: u32,
}

impl EllipticSum {
    /// Create a checksum initialized to the group identity, with a worker
    /// pool sized to the number of hardware threads.
    pub fn new() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4) as u32;
        Self {
            acc: Arc::new(Mutex::new(RistrettoPoint::identity())),
            workers: Arc::new(Semaphore::new(max_workers as usize)),
            max_workers,
        }
    }

    /// Schedule `data` to be added to the checksum.
    ///
    /// Returns once a worker slot is acquired; the hash and the point
    /// addition complete asynchronously. Call [`wait`](Self::wait) or
    /// [`snapshot`](Self::snapshot) to observe the settled value.
    pub async fn add(&self, data: Vec<u8>) -> Result<()> {
        self.schedule(data, false).await
    }

    /// Schedule `data` to be removed from the checksum.
    ///
    /// Removal adds the inverse point: if `(x, y)` was added for this data,
    /// adding `(x, -y)` cancels it out of the sum.
    pub async fn remove(&self, data: Vec<u8>) -> Result<()> {
        self.schedule(data, true).await
    }

    async fn schedule(&self, data: Vec<u8>, negate: bool) -> Result<()> {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| ChecksumError::Scheduling)?;

        let acc = Arc::clone(&self.acc);
        tokio::spawn(async move {
            let mut point = hash_to_point(&data);
            if negate {
                point = -point;
            }
            *acc.lock() += point;
            drop(permit);
        });
        Ok(())
    }

    /// Block until every scheduled update has been folded into the
    /// accumulator.
    pub async fn wait(&self) -> Result<()> {
        let _all = self
            .workers
            .acquire_many(self.max_workers)
            .await
            .map_err(|_| ChecksumError::Scheduling)?;
        Ok(())
    }

    /// Drain the pool and return a copy of the accumulator point.
    pub async fn snapshot(&self) -> Result<RistrettoPoint> {
        let _all = self
            .workers
            .acquire_many(self.max_workers)
            .await
            .map_err(|_| ChecksumError::Scheduling)?;
        Ok(*self.acc.lock())
    }

    /// Drain the pool and return the canonical compressed encoding.
    ///
    /// The 32-byte Ristretto encoding is part of the peer protocol.
    pub async fn to_bytes(&self) -> Result<[u8; CHECKSUM_BYTES]> {
        Ok(self.snapshot().await?.compress().to_bytes())
    }

    /// Shut the worker pool down.
    ///
    /// Pending and future `add`/`remove`/`wait` calls fail with
    /// [`ChecksumError::Scheduling`]; work already scheduled still completes.
    pub fn close(&self) {
        self.workers.close();
    }
}

impl Default for EllipticSum {
    fn default() -> Self {
        Self::new()
    }
}
