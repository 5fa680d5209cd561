//! Snapshot engine
//!
//! The [`SnapshotEngine`] is the heart of hyper-sync. It serves three
//! purposes:
//!
//! - maintaining the ancestral records that reconstruct the database at the
//!   last snapshot height,
//! - managing the state checksum,
//! - serving snapshot chunks to syncing peers (see [`crate::chunks`]).
//!
//! Every mutation of the checksum, the ancestral database and the epoch
//! state happens on a single dispatcher task that consumes a bounded
//! operation channel. Producers (the view layer flushing mutation batches,
//! the block processor, chunk RPC handlers) enqueue operations and never
//! take engine-internal locks, so block processing is minimally affected by
//! snapshot work.
//!
//! ## Generation counters
//!
//! Two counters, one for the live database and one for the ancestral
//! records, are incremented at both the beginning and the end of every flush
//! (`prepare_ancestral_flush` bumps the main counter, `enqueue_ancestral_flush`
//! bumps both, and the flush itself bumps the ancestral counter on
//! completion). The pair is therefore equal-and-even exactly when no flush is
//! in flight, which is what lets chunk serving read both databases without
//! locking and detect races after the fact.

use crate::cache::AncestralCache;
use crate::records;
use crate::{
    Hash, Result, SnapshotError, DEFAULT_EPOCH_PERIOD, OPERATION_CHANNEL_CAPACITY,
};
use meridian_crypto::EllipticSum;
use meridian_storage::{Database, DatabaseConfig, DbEntry};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the snapshot engine
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Directory the ancestral records database lives under
    pub data_dir: PathBuf,
    /// Number of blocks between snapshot epochs; `0` selects the default
    pub epoch_period: u64,
}

impl SnapshotConfig {
    /// Create a configuration with the default epoch period
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            epoch_period: DEFAULT_EPOCH_PERIOD,
        }
    }

    /// Set the epoch period
    pub fn with_epoch_period(mut self, epoch_period: u64) -> Self {
        self.epoch_period = epoch_period;
        self
    }
}

/// Frozen identity of the current snapshot epoch
#[derive(Debug, Clone, Default)]
pub struct EpochState {
    /// Block height of the most recent snapshot boundary
    pub height: u64,
    /// Compressed checksum frozen at the boundary
    pub checksum_bytes: Vec<u8>,
    /// Hash of the first block of the epoch
    pub block_hash: Hash,
}

/// Generation counter pair guarding flush/serve races.
///
/// Both counters are read and written together under one mutex; their parity
/// and equality encode "flush in progress" vs quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Generations {
    pub(crate) main: i32,
    pub(crate) ancestral: i32,
}

impl Generations {
    /// Whether a live-database or ancestral flush is in flight.
    pub(crate) fn is_flushing(self) -> bool {
        self.main != self.ancestral || (self.main | self.ancestral) % 2 == 1
    }
}

/// Operations consumed by the dispatcher task
enum SnapshotOperation {
    /// Persist the head ancestral cache
    Flush,
    /// A block finished processing; may advance the snapshot epoch
    ProcessBlock { height: u64, hash: Hash },
    /// Apply a chunk received from a peer to the live database
    ProcessChunk {
        db: Arc<Database>,
        entries: Vec<DbEntry>,
    },
    /// Add bytes to the state checksum
    ChecksumAdd(Vec<u8>),
    /// Remove bytes from the state checksum
    ChecksumRemove(Vec<u8>),
    /// Log the current checksum digest
    ChecksumPrint(String),
    /// Acknowledge once every earlier operation has been handled
    Barrier(oneshot::Sender<()>),
}

/// State shared between the engine handle and its dispatcher task.
pub(crate) struct EngineShared {
    /// The ancestral records database
    pub(crate) ancestral_db: Arc<Database>,
    /// The state checksum
    pub(crate) checksum: EllipticSum,
    /// Staged ancestral caches; producers append at the tail, the dispatcher
    /// pops from the head
    pub(crate) caches: Mutex<VecDeque<AncestralCache>>,
    /// Id of the most recently opened cache
    pub(crate) flush_counter: AtomicU64,
    /// Flush/serve race detection
    pub(crate) generations: Mutex<Generations>,
    /// Current epoch identity
    pub(crate) epoch: RwLock<EpochState>,
    /// Latched when an ancestral write fails; state operations then no-op
    /// until the node restarts and rebuilds
    pub(crate) broken: AtomicBool,
    /// Blocks between snapshot epochs
    pub(crate) epoch_period: u64,
}

/// The snapshot engine handle.
///
/// Cheap accessors run on the caller's thread; everything that mutates
/// engine state is enqueued for the dispatcher.
pub struct SnapshotEngine {
    shared: Arc<EngineShared>,
    op_tx: mpsc::Sender<SnapshotOperation>,
    shutdown_tx: mpsc::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotEngine {
    /// Open the ancestral records database under `data_dir` and start the
    /// dispatcher task.
    ///
    /// Must be called within a Tokio runtime. If the previous run died in
    /// the middle of an ancestral flush (dirty health byte), the engine
    /// comes up broken and state operations no-op until the snapshot is
    /// rebuilt from scratch.
    pub fn new(config: SnapshotConfig) -> Result<Self> {
        let path = config.data_dir.join("snapshot");
        let ancestral_db = Database::open(DatabaseConfig {
            path,
            ..Default::default()
        })?;

        let broken = match ancestral_db.get_opt(&records::HEALTH_KEY)? {
            Some(health) if health.first() == Some(&records::HEALTH_DIRTY) => {
                warn!("ancestral records were left mid-flush by a previous run; snapshot must be rebuilt");
                true
            }
            _ => false,
        };

        let epoch_period = if config.epoch_period == 0 {
            DEFAULT_EPOCH_PERIOD
        } else {
            config.epoch_period
        };

        let shared = Arc::new(EngineShared {
            ancestral_db: Arc::new(ancestral_db),
            checksum: EllipticSum::new(),
            caches: Mutex::new(VecDeque::new()),
            flush_counter: AtomicU64::new(0),
            generations: Mutex::new(Generations::default()),
            epoch: RwLock::new(EpochState::default()),
            broken: AtomicBool::new(broken),
            epoch_period,
        });

        let (op_tx, op_rx) = mpsc::channel(OPERATION_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let dispatcher = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            dispatcher.run(op_rx, shutdown_rx).await;
        });

        Ok(Self {
            shared,
            op_tx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the dispatcher and wait for it to exit.
    ///
    /// Operations still queued are dropped; in-flight checksum work fails
    /// with a scheduling error.
    pub async fn stop(&self) {
        info!("stopping snapshot engine");
        let _ = self.shutdown_tx.send(()).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("snapshot dispatcher task failed: {e}");
            }
        }
        self.shared.checksum.close();
    }

    /// Open a new ancestral cache for the mutation batch about to be built.
    ///
    /// Must be called before any [`prepare_ancestral_record`] for the batch.
    ///
    /// [`prepare_ancestral_record`]: Self::prepare_ancestral_record
    pub fn prepare_ancestral_flush(&self) {
        if self.is_broken() {
            warn!("snapshot is broken, ignoring ancestral flush preparation");
            return;
        }
        // Signal that a live-database update has started.
        self.shared.generations.lock().main += 1;

        let id = self.shared.flush_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.caches.lock().push_back(AncestralCache::new(id));
        debug!(id, "opened ancestral cache");
    }

    /// Record the pre-batch state of `key` in the open cache.
    ///
    /// `Some(value)` means the key currently exists in the live database
    /// with `value`; `None` means it does not. The first recording per key
    /// and batch wins; repeats are ignored.
    pub fn prepare_ancestral_record(&self, key: &[u8], prev_value: Option<&[u8]>) -> Result<()> {
        if self.is_broken() {
            return Ok(());
        }
        let flush_counter = self.shared.flush_counter.load(Ordering::SeqCst);
        let mut caches = self.shared.caches.lock();
        let Some(cache) = caches.back_mut() else {
            return Err(SnapshotError::CacheMissing);
        };
        if cache.id() != flush_counter {
            return Err(SnapshotError::CacheIdMismatch {
                cache_id: cache.id(),
                flush_counter,
            });
        }
        cache.record(key, prev_value);
        Ok(())
    }

    /// Enqueue the flush of the open ancestral cache.
    ///
    /// Call after the mutation batch has been committed to the live
    /// database.
    pub async fn enqueue_ancestral_flush(&self) -> Result<()> {
        if self.is_broken() {
            warn!("snapshot is broken, dropping ancestral flush");
            return Ok(());
        }
        // The live-database update has finished and the ancestral write is
        // now pending.
        {
            let mut generations = self.shared.generations.lock();
            generations.main += 1;
            generations.ancestral += 1;
        }
        self.send(SnapshotOperation::Flush).await
    }

    /// Notify the engine that `height` finished processing.
    ///
    /// At epoch-boundary heights this advances the snapshot epoch: the
    /// checksum is frozen, the block hash recorded, and the retired epoch's
    /// ancestral records dropped.
    pub async fn finish_process_block(&self, height: u64, hash: Hash) -> Result<()> {
        self.send(SnapshotOperation::ProcessBlock { height, hash })
            .await
    }

    /// Enqueue a snapshot chunk received from a peer for application to the
    /// live database.
    pub async fn process_snapshot_chunk(
        &self,
        db: Arc<Database>,
        entries: Vec<DbEntry>,
    ) -> Result<()> {
        self.send(SnapshotOperation::ProcessChunk { db, entries })
            .await
    }

    /// Enqueue a checksum addition.
    pub async fn add_checksum_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(SnapshotOperation::ChecksumAdd(bytes)).await
    }

    /// Enqueue a checksum removal.
    pub async fn remove_checksum_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(SnapshotOperation::ChecksumRemove(bytes)).await
    }

    /// Log the current checksum digest, tagged with `tag`.
    pub async fn print_checksum(&self, tag: impl Into<String>) -> Result<()> {
        self.send(SnapshotOperation::ChecksumPrint(tag.into())).await
    }

    /// Wait until every operation enqueued before this call has been
    /// handled by the dispatcher.
    pub async fn wait_for_operations(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SnapshotOperation::Barrier(tx)).await?;
        rx.await.map_err(|_| SnapshotError::Stopped)
    }

    /// The settled checksum in its compressed wire encoding.
    pub async fn checksum_bytes(&self) -> Result<[u8; 32]> {
        Ok(self.shared.checksum.to_bytes().await?)
    }

    /// The frozen identity of the current snapshot epoch.
    pub fn current_epoch(&self) -> EpochState {
        self.shared.epoch.read().clone()
    }

    /// Whether a live-database or ancestral flush is in flight.
    pub fn is_flushing(&self) -> bool {
        self.shared.generations.lock().is_flushing()
    }

    /// Whether the snapshot is broken and must be rebuilt.
    pub fn is_broken(&self) -> bool {
        self.shared.broken.load(Ordering::SeqCst)
    }

    /// Handle to the ancestral records database.
    pub fn ancestral_db(&self) -> &Arc<Database> {
        &self.shared.ancestral_db
    }

    /// Serve a chunk of the snapshot-height database. See
    /// [`crate::chunks`].
    pub fn get_snapshot_chunk(
        &self,
        live_db: &Database,
        prefix: &[u8],
        start_key: &[u8],
    ) -> Result<crate::chunks::ChunkFetch> {
        self.shared.get_snapshot_chunk(live_db, prefix, start_key)
    }

    async fn send(&self, op: SnapshotOperation) -> Result<()> {
        self.op_tx.send(op).await.map_err(|_| SnapshotError::Stopped)
    }
}

impl fmt::Display for SnapshotEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "< Snapshot | height: {} | broken: {} >",
            self.shared.epoch.read().height,
            self.is_broken()
        )
    }
}

impl EngineShared {
    /// Dispatcher main loop.
    async fn run(
        self: Arc<Self>,
        mut op_rx: mpsc::Receiver<SnapshotOperation>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("snapshot dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("snapshot dispatcher stopping");
                    break;
                }
                op = op_rx.recv() => match op {
                    Some(op) => self.handle_operation(op).await,
                    None => break,
                }
            }
        }
    }

    async fn handle_operation(&self, op: SnapshotOperation) {
        match op {
            SnapshotOperation::Flush => self.flush_ancestral_records().await,
            SnapshotOperation::ProcessBlock { height, hash } => {
                self.process_block(height, hash).await;
            }
            SnapshotOperation::ProcessChunk { db, entries } => {
                if let Err(e) = self.set_snapshot_chunk(&db, &entries).await {
                    error!("failed to apply snapshot chunk: {e}");
                }
            }
            SnapshotOperation::ChecksumAdd(bytes) => {
                if let Err(e) = self.checksum.add(bytes).await {
                    error!("failed to schedule checksum addition: {e}");
                }
            }
            SnapshotOperation::ChecksumRemove(bytes) => {
                if let Err(e) = self.checksum.remove(bytes).await {
                    error!("failed to schedule checksum removal: {e}");
                }
            }
            SnapshotOperation::ChecksumPrint(tag) => match self.checksum.to_bytes().await {
                Ok(digest) => info!("checksum [{tag}]: {}", hex::encode(digest)),
                Err(e) => error!("failed to read checksum for [{tag}]: {e}"),
            },
            SnapshotOperation::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Persist the head ancestral cache into the ancestral database.
    async fn flush_ancestral_records(&self) {
        if self.broken.load(Ordering::SeqCst) {
            warn!("snapshot is broken, skipping ancestral flush");
            return;
        }

        // No in-flight checksum update may overlap persistence; the flush
        // must observe every addition enqueued before it.
        if let Err(e) = self.checksum.wait().await {
            error!("failed to drain checksum before ancestral flush: {e}");
            return;
        }

        let Some(cache) = self.caches.lock().pop_front() else {
            error!("ancestral flush requested with no staged cache");
            return;
        };
        let epoch_height = self.epoch.read().height;
        debug!(records = cache.len(), epoch_height, "flushing ancestral records");

        let result = self.ancestral_db.update(|txn| {
            // In case the node dies in the middle of this transaction.
            txn.put(&records::HEALTH_KEY, &[records::HEALTH_DIRTY]);
            for (key, value) in cache.iter() {
                let record_key = records::ancestral_record_key(epoch_height, key);
                // The earliest recorded pre-image within an epoch is the
                // authoritative one.
                if txn.get(&record_key)?.is_some() {
                    continue;
                }
                txn.put(&record_key, &records::ancestral_record_value(value));
            }
            txn.put(&records::HEALTH_KEY, &[records::HEALTH_CLEAN]);
            Ok(())
        });

        match result {
            Ok(()) => {
                // The ancestral write has finished.
                self.generations.lock().ancestral += 1;
                debug!("ancestral flush complete");
            }
            Err(e) => {
                self.broken.store(true, Ordering::SeqCst);
                self.caches.lock().push_front(cache);
                error!("failed to flush ancestral records, snapshot is now broken: {e}");
            }
        }
    }

    /// Advance the snapshot epoch when `height` is a boundary.
    async fn process_block(&self, height: u64, hash: Hash) {
        if self.broken.load(Ordering::SeqCst) {
            return;
        }
        if height % self.epoch_period != 0 {
            return;
        }

        let previous_height = self.epoch.read().height;
        info!(previous_height, height, "advancing snapshot epoch");

        let checksum_bytes = match self.checksum.to_bytes().await {
            Ok(digest) => digest.to_vec(),
            Err(e) => {
                error!("failed to freeze epoch checksum: {e}");
                Vec::new()
            }
        };
        {
            let mut epoch = self.epoch.write();
            epoch.height = height;
            epoch.checksum_bytes = checksum_bytes;
            epoch.block_hash = hash;
        }

        // Retire the epoch that just ended, never the one just created.
        if previous_height != height {
            self.delete_ancestral_records(previous_height);
        }
    }

    /// Drop every ancestral record belonging to `height`.
    fn delete_ancestral_records(&self, height: u64) {
        debug!(height, "dropping retired ancestral records");
        if let Err(e) = self.ancestral_db.drop_prefix(&records::epoch_prefix(height)) {
            error!(height, "failed to drop retired ancestral records: {e}");
        }
    }
}
