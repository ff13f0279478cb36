//! Byte offsets of the journal's regions inside its backing buffer.
//!
//! The buffer is carved into six consecutive regions:
//!
//! | region | size |
//! |---|---|
//! | map header `{version, length, head, bucket_count}` | 16 |
//! | bucket meta `{count, deleted}` per bucket | 2·B |
//! | slot hashes (u64, 4 slots per bucket) | 32·B |
//! | entry bodies (24 bytes, 4 slots per bucket) | 96·B |
//! | log header `{head, length, seq, cap}` | 24 |
//! | log data (i32 slot indices, −1 = cleared) | 4·L |
//! | data ring (concatenated key‖value bytes) | rest |
//!
//! The body region is aligned to 8 bytes. All integers are native-endian;
//! a buffer written on one architecture is not meant to be read on another.

pub(crate) const MAP_VERSION: i32 = 1;
pub(crate) const LOAD_FACTOR: f64 = 0.75;
pub(crate) const SLOTS_PER_BUCKET: u32 = 4;

pub(crate) const VERSION_OFF: usize = 0;
pub(crate) const LENGTH_OFF: usize = 4;
pub(crate) const HEAD_OFF: usize = 8;
pub(crate) const BUCKETS_OFF: usize = 12;

/// Offsets of the `{log_offset, key_offset, key_size, value_size,
/// prev_offset, next_offset}` fields within a 24-byte body record.
pub(crate) const BODY_SIZE: usize = 24;

/// Overflow flag in a bucket's `deleted` byte; the low four bits are the
/// per-slot tombstone bitmap.
pub(crate) const OVERFLOW_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub bucket_count: u32,
    pub log_cap: u32,
    pub meta_off: usize,
    pub hash_off: usize,
    pub body_off: usize,
    pub log_hdr_off: usize,
    pub log_data_off: usize,
    pub data_off: usize,
    pub data_len: usize,
}

pub(crate) fn bucket_count_for(capacity: u32) -> u32 {
    let buckets = (capacity as f64 / LOAD_FACTOR / SLOTS_PER_BUCKET as f64) as u32;
    buckets.max(1)
}

impl Layout {
    pub fn compute(buf_len: usize, log_cap: u32, capacity: u32) -> Layout {
        let b = bucket_count_for(capacity) as usize;
        let pad = (8 - (34 * b) % 8) % 8;
        let meta_off = 16;
        let hash_off = meta_off + 2 * b;
        let body_off = 16 + 34 * b + pad;
        let log_hdr_off = body_off + BODY_SIZE * SLOTS_PER_BUCKET as usize * b;
        let log_data_off = log_hdr_off + 24;
        let data_off = log_data_off + 4 * log_cap as usize;

        assert!(
            buf_len > data_off,
            "journal buffer too small: {buf_len} bytes, header alone needs {data_off}"
        );

        Layout {
            bucket_count: b as u32,
            log_cap,
            meta_off,
            hash_off,
            body_off,
            log_hdr_off,
            log_data_off,
            data_off,
            data_len: buf_len - data_off,
        }
    }
}

/// Size in bytes of everything before the data ring, for callers sizing
/// their buffers.
pub fn header_size(log_cap: u32, capacity: u32) -> usize {
    let b = bucket_count_for(capacity) as usize;
    let pad = (8 - (34 * b) % 8) % 8;
    40 + 130 * b + pad + 4 * log_cap as usize
}
