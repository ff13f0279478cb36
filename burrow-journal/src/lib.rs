//! A fixed-capacity key→value store laid out entirely inside a caller-provided
//! byte buffer, with insertion-ordered eviction and a circular write log.
//!
//! The buffer can be anything that dereferences to `[u8]`: a `Vec<u8>`, a
//! boxed slice, or a shared memory mapping. All bookkeeping (hash buckets,
//! entry metadata, the write log and the data ring) lives inside that buffer,
//! so a journal backed by a file mapping survives process restarts: building
//! a [`Journal`] over a buffer that already contains a journal with the same
//! parameters reattaches to it instead of clearing it.
//!
//! Lookups against contiguous records borrow directly from the buffer; only
//! records that wrap around the end of the data ring are copied out.
//!
//! The journal is strictly single-writer. Writes optionally emit a
//! [`JournalEvent`] per successful [`Journal::set`] on an attached channel,
//! and the tail of the write log can be replayed with [`Journal::log_iter`].

mod journal;
mod layout;

pub use journal::{Journal, JournalIter, JournalLogIter};
pub use layout::header_size;

/// A change record emitted on the notification channel and yielded by
/// [`Journal::log_iter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEvent {
    pub key: String,
    pub value: Vec<u8>,
    pub seq: i64,
}

/// Returned by [`Journal::set`] when every bucket has been probed and no slot
/// could be claimed or reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalFull;

impl std::fmt::Display for JournalFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "journal hash map is full")
    }
}

impl std::error::Error for JournalFull {}

/// DJB2 over the key bytes, the hash the bucket array is keyed by.
pub(crate) fn djb2(key: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for b in key {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(*b as u64);
    }
    hash
}
