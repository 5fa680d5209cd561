//! On-disk layout of the ancestral records database
//!
//! Ancestral records hold the historical values of live entries modified
//! during a snapshot epoch. If the live database changed `<key, value>` to
//! `<key, value_new>`, the old state is kept under:
//!
//! ```text
//! <0x00, epoch_height [8]byte BE, key> -> <value, existence_byte [1]byte>
//! ```
//!
//! The existence byte is `0x01` when the key previously existed in the live
//! database and `0x00` when it did not (in which case the stored value is
//! empty). It lives in the value rather than the key so a single point lookup
//! answers "has this key already been recorded this epoch".
//!
//! A second, single-key prefix tracks flush health:
//!
//! ```text
//! <0x01> -> <health_byte [1]byte>
//! ```
//!
//! The health byte is `0x00` while a flush transaction is in progress and
//! `0x01` once it completed cleanly; finding `0x00` at startup means the
//! process died mid-flush and the snapshot must be rebuilt.

use crate::cache::AncestralValue;
use crate::{Result, SnapshotError};
use meridian_storage::DbEntry;

/// Prefix under which ancestral records are stored.
pub const ANCESTRAL_RECORD_PREFIX: u8 = 0x00;

/// Key of the flush-health byte.
pub const HEALTH_KEY: [u8; 1] = [0x01];

/// Health value written when a flush completes cleanly.
pub const HEALTH_CLEAN: u8 = 0x01;

/// Health value held while a flush transaction is in progress.
pub const HEALTH_DIRTY: u8 = 0x00;

/// Length of the record-key header: prefix byte plus big-endian height.
const RECORD_KEY_HEADER_LEN: usize = 9;

/// Existence byte for a key that previously existed.
const EXISTENCE_YES: u8 = 0x01;

/// Existence byte for a key that did not previously exist.
const EXISTENCE_NO: u8 = 0x00;

/// Build the ancestral record key for a live key at `epoch_height`.
pub fn ancestral_record_key(epoch_height: u64, key: &[u8]) -> Vec<u8> {
    let mut record_key = Vec::with_capacity(RECORD_KEY_HEADER_LEN + key.len());
    record_key.push(ANCESTRAL_RECORD_PREFIX);
    record_key.extend_from_slice(&epoch_height.to_be_bytes());
    record_key.extend_from_slice(key);
    record_key
}

/// The key prefix covering every ancestral record of one epoch.
pub fn epoch_prefix(epoch_height: u64) -> Vec<u8> {
    ancestral_record_key(epoch_height, &[])
}

/// Encode a cached pre-image as an ancestral record value.
pub fn ancestral_record_value(value: &AncestralValue) -> Vec<u8> {
    match value {
        AncestralValue::Existing(prev) => {
            let mut encoded = Vec::with_capacity(prev.len() + 1);
            encoded.extend_from_slice(prev);
            encoded.push(EXISTENCE_YES);
            encoded
        }
        AncestralValue::NonExistent => vec![EXISTENCE_NO],
    }
}

/// Whether an ancestral record value carries the "previously existed" flag.
pub fn record_existence(value: &[u8]) -> bool {
    value.last() == Some(&EXISTENCE_YES)
}

/// Translate a raw ancestral entry back into live-database form.
///
/// Strips the 9-byte header from the key and the trailing existence byte from
/// the value, returning the existence flag alongside the translated entry.
pub fn ancestral_entry_to_db_entry(entry: &DbEntry) -> Result<(DbEntry, bool)> {
    if entry.key.len() < RECORD_KEY_HEADER_LEN {
        return Err(SnapshotError::Encoding(format!(
            "ancestral key too short: 0x{}",
            hex::encode(&entry.key)
        )));
    }
    if entry.value.is_empty() {
        return Err(SnapshotError::Encoding(format!(
            "ancestral record for key 0x{} has no existence byte",
            hex::encode(&entry.key)
        )));
    }
    let key = entry.key[RECORD_KEY_HEADER_LEN..].to_vec();
    let value = entry.value[..entry.value.len() - 1].to_vec();
    Ok((DbEntry::new(key, value), record_existence(&entry.value)))
}
