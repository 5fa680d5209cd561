//! Chunk server and ingester
//!
//! A syncing peer asks for the contiguous slice `[start_key, ∞)` within a
//! prefix of the database **as it existed at the snapshot height**. The live
//! database is ahead of that height; the missing history sits in the
//! ancestral records. Serving a chunk therefore merges a bounded scan of the
//! live database with a bounded scan of the ancestral records, with the
//! ancestral side winning wherever both hold the same key.
//!
//! Serving never blocks writers. Instead the generation counters are read
//! before and after the scans; if they moved, or a flush was already in
//! flight, the batch is discarded and the caller gets a
//! [`ChunkFetch::ConcurrencyFault`], a normal control signal telling it to
//! retry with the same start key. This optimistic-read pattern avoids
//! pinning an LSM snapshot across the RPC boundary.

use crate::engine::EngineShared;
use crate::{records, Result, SNAPSHOT_BATCH_SIZE};
use meridian_storage::{Database, DbEntry, WriteBatch};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// A bounded slice of the snapshot-height database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// Entries in ascending key order. A lone empty sentinel entry means the
    /// requested range holds nothing.
    pub entries: Vec<DbEntry>,
    /// Whether either underlying scan was saturated; `false` means the range
    /// is exhausted
    pub full: bool,
}

/// Outcome of a chunk request.
#[derive(Debug)]
pub enum ChunkFetch {
    /// The merged batch
    Batch(SnapshotChunk),
    /// The databases mutated during the read; retry with the same start key
    ConcurrencyFault,
}

impl EngineShared {
    /// Serve a chunk of the snapshot-height database.
    ///
    /// Fetches up to [`SNAPSHOT_BATCH_SIZE`] entries from the live database
    /// and from the ancestral records, and merges them so the batch reflects
    /// the database at the current epoch height.
    pub(crate) fn get_snapshot_chunk(
        &self,
        live_db: &Database,
        prefix: &[u8],
        start_key: &[u8],
    ) -> Result<ChunkFetch> {
        // If a flush is mutating either database the batch would be torn.
        let generations_before = *self.generations.lock();
        if generations_before.is_flushing() {
            return Ok(ChunkFetch::ConcurrencyFault);
        }

        let epoch_height = self.epoch.read().height;

        let (live_entries, live_full) =
            live_db.iterate_prefix(prefix, start_key, SNAPSHOT_BATCH_SIZE)?;
        let (ancestral_entries, ancestral_full) = self.ancestral_db.iterate_prefix(
            &records::ancestral_record_key(epoch_height, prefix),
            &records::ancestral_record_key(epoch_height, start_key),
            SNAPSHOT_BATCH_SIZE,
        )?;

        // Outer join in key order. For each ancestral record, first emit the
        // live entries sorted below it; on equal keys the ancestral value
        // wins and the live one is suppressed. Looks quadratic, but the
        // inner loop advances a shared cursor so the total work is linear.
        let mut entries: Vec<DbEntry> = Vec::new();
        let mut live_index = 0;
        for raw in &ancestral_entries {
            let (ancestral_entry, existed) = records::ancestral_entry_to_db_entry(raw)?;
            while live_index < live_entries.len() {
                match live_entries[live_index].key.cmp(&ancestral_entry.key) {
                    Ordering::Less => entries.push(live_entries[live_index].clone()),
                    Ordering::Greater => break,
                    Ordering::Equal => {}
                }
                live_index += 1;
            }
            // Keys that did not exist at the snapshot height are not part
            // of the chunk.
            if existed {
                entries.push(ancestral_entry);
            }
            // Once a saturated live batch is exhausted, stop: a live-bounded
            // page guarantees no gap between this page and the next.
            if live_full && live_index == live_entries.len() {
                break;
            }
        }

        // All ancestral records consumed; the remaining live entries belong
        // to the chunk as-is.
        if !ancestral_full {
            entries.extend(live_entries[live_index..].iter().cloned());
        }

        if entries.is_empty() {
            return Ok(ChunkFetch::Batch(SnapshotChunk {
                entries: vec![DbEntry::empty()],
                full: false,
            }));
        }

        // A flush may have started and finished while we were scanning.
        if *self.generations.lock() != generations_before {
            return Ok(ChunkFetch::ConcurrencyFault);
        }

        Ok(ChunkFetch::Batch(SnapshotChunk {
            entries,
            full: live_full || ancestral_full,
        }))
    }

    /// Apply a snapshot chunk received from a peer to the live database.
    ///
    /// The whole chunk commits as one write batch; only after the commit
    /// succeeds are the entries scheduled into the checksum, so a failed
    /// batch never advances the digest.
    pub(crate) async fn set_snapshot_chunk(
        &self,
        db: &Database,
        entries: &[DbEntry],
    ) -> Result<()> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for entry in entries {
            batch.put(&entry.key, &entry.value);
        }
        db.write(batch)?;

        for entry in entries {
            self.checksum.add(entry.encode()).await?;
        }
        debug!(entries = entries.len(), "applied snapshot chunk");
        Ok(())
    }
}
