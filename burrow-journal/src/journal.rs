use std::{
    borrow::Cow,
    ops::{Deref, DerefMut},
};

use tokio::sync::mpsc::UnboundedSender;

use crate::{
    djb2,
    layout::{Layout, BODY_SIZE, BUCKETS_OFF, HEAD_OFF, LENGTH_OFF, MAP_VERSION, OVERFLOW_BIT, SLOTS_PER_BUCKET, VERSION_OFF},
    JournalEvent, JournalFull,
};

/// The in-buffer hash map plus circular write log. `B` is the backing buffer;
/// any `Vec<u8>`, boxed slice, mutable slice or writable memory mapping works.
pub struct Journal<B> {
    buf: B,
    layout: Layout,
    notify: Option<UnboundedSender<JournalEvent>>,
}

/// A 24-byte entry record. `prev_offset`/`next_offset` are slot indices
/// threading the insertion-order cycle; `log_offset` points back into the
/// write log, -1 when the entry has no live log record.
#[derive(Debug, Clone, Copy, Default)]
struct Body {
    log_offset: i32,
    key_offset: i32,
    key_size: i32,
    value_size: i32,
    prev_offset: i32,
    next_offset: i32,
}

/// Outcome of probing the bucket array for a slot to write `key` into.
enum WriteSlot {
    /// The key is already present at this slot.
    Found(i32),
    /// A tombstoned slot that can be reclaimed.
    Reuse(i32),
    /// An untouched slot at the end of a bucket.
    Fresh(i32),
    /// Every bucket was scanned and nothing can be reclaimed.
    Full,
}

impl<B: Deref<Target = [u8]>> Journal<B> {
    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.read_i32(LENGTH_OFF) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The write sequence counter. Incremented once per successful
    /// [`set`](Journal::set).
    pub fn seq(&self) -> i64 {
        self.read_i64(self.layout.log_hdr_off + 8)
    }

    /// Looks up `key`, returning a borrowed view of the value when the record
    /// is contiguous in the ring and an owned copy when it wraps.
    pub fn get(&self, key: &str) -> Option<Cow<'_, [u8]>> {
        let slot = self.probe_read(key.as_bytes(), djb2(key.as_bytes()))?;
        let b = self.body(slot);
        let start = self.wrap(b.key_offset + b.key_size) as usize;
        Some(self.ring_read(start, b.value_size as usize))
    }

    /// Iterates live entries in insertion order, oldest first.
    pub fn iter(&self) -> JournalIter<'_, B> {
        JournalIter { journal: self, offset: -1 }
    }

    /// Replays the write log from sequence number `from`, skipping cleared
    /// records. `from` is clamped to the oldest sequence the log retains.
    pub fn log_iter(&self, from: i64) -> JournalLogIter<'_, B> {
        JournalLogIter { journal: self, from }
    }

    fn probe_read(&self, key: &[u8], hash: u64) -> Option<i32> {
        let buckets = self.layout.bucket_count as i32;
        let mut bucket = (hash % buckets as u64) as i32;
        let mut start_bucket = -1;

        while start_bucket != bucket {
            if start_bucket == -1 {
                start_bucket = bucket;
            }

            let (count, deleted) = self.meta(bucket);
            let bucket4 = bucket * 4;

            for slot in 0..count as i32 {
                if deleted & (1 << slot) != 0 {
                    continue;
                }
                if self.hash_at(bucket4 + slot) == hash && self.key_matches(bucket4 + slot, key) {
                    return Some(bucket4 + slot);
                }
            }

            if (count as u32) < SLOTS_PER_BUCKET || deleted & OVERFLOW_BIT == 0 {
                return None;
            }

            bucket += 1;
            if bucket == buckets {
                bucket = 0;
            }
        }

        None
    }

    fn key_matches(&self, slot: i32, key: &[u8]) -> bool {
        let b = self.body(slot);
        if b.key_size as usize != key.len() {
            return false;
        }

        let data = self.data();
        let start = b.key_offset as usize;
        let size = b.key_size as usize;

        if start + size > data.len() {
            let first = data.len() - start;
            data[start..] == key[..first] && data[..size - first] == key[first..]
        } else {
            data[start..start + size] == *key
        }
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.layout.data_off..]
    }

    fn ring_read(&self, start: usize, len: usize) -> Cow<'_, [u8]> {
        let data = self.data();
        if start + len > data.len() {
            let mut out = Vec::with_capacity(len);
            out.extend_from_slice(&data[start..]);
            out.extend_from_slice(&data[..len - (data.len() - start)]);
            Cow::Owned(out)
        } else {
            Cow::Borrowed(&data[start..start + len])
        }
    }

    fn wrap(&self, pos: i32) -> i32 {
        let data_len = self.layout.data_len as i32;
        let mut pos = pos;
        while pos >= data_len {
            pos -= data_len;
        }
        pos
    }

    fn read_i32(&self, off: usize) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[off..off + 4]);
        i32::from_ne_bytes(b)
    }

    fn read_i64(&self, off: usize) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[off..off + 8]);
        i64::from_ne_bytes(b)
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[off..off + 8]);
        u64::from_ne_bytes(b)
    }

    fn head(&self) -> i32 {
        self.read_i32(HEAD_OFF)
    }

    fn meta(&self, bucket: i32) -> (u8, u8) {
        let off = self.layout.meta_off + 2 * bucket as usize;
        (self.buf[off], self.buf[off + 1])
    }

    fn hash_at(&self, slot: i32) -> u64 {
        self.read_u64(self.layout.hash_off + 8 * slot as usize)
    }

    fn body(&self, slot: i32) -> Body {
        let off = self.layout.body_off + BODY_SIZE * slot as usize;
        Body {
            log_offset: self.read_i32(off),
            key_offset: self.read_i32(off + 4),
            key_size: self.read_i32(off + 8),
            value_size: self.read_i32(off + 12),
            prev_offset: self.read_i32(off + 16),
            next_offset: self.read_i32(off + 20),
        }
    }

    fn log_head(&self) -> i32 {
        self.read_i32(self.layout.log_hdr_off)
    }

    fn log_len(&self) -> i32 {
        self.read_i32(self.layout.log_hdr_off + 4)
    }

    fn log_cap(&self) -> i32 {
        self.layout.log_cap as i32
    }

    fn log_entry(&self, index: i32) -> i32 {
        self.read_i32(self.layout.log_data_off + 4 * index as usize)
    }

    fn entry_key(&self, b: Body) -> String {
        let bytes = self.ring_read(b.key_offset as usize, b.key_size as usize).into_owned();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn entry_value(&self, b: Body) -> Vec<u8> {
        let start = self.wrap(b.key_offset + b.key_size) as usize;
        self.ring_read(start, b.value_size as usize).into_owned()
    }
}

impl<B: DerefMut<Target = [u8]>> Journal<B> {
    /// Builds a journal over `buf` with the given write-log capacity and
    /// entry capacity. If `buf` already holds a journal with the same
    /// parameters it is reattached with its contents intact; otherwise the
    /// header is reinitialised.
    ///
    /// Panics if `buf` is too small to hold the bookkeeping regions plus a
    /// non-empty data ring; see [`header_size`](crate::header_size).
    pub fn new(buf: B, log_cap: u32, capacity: u32) -> Journal<B> {
        let layout = Layout::compute(buf.len(), log_cap, capacity);
        let mut journal = Journal { buf, layout, notify: None };

        let stored_buckets = journal.read_i32(BUCKETS_OFF);
        let stored_log_cap = journal.read_i32(journal.layout.log_hdr_off + 16);
        if journal.read_i32(VERSION_OFF) != MAP_VERSION
            || stored_buckets != layout.bucket_count as i32
            || stored_log_cap != log_cap as i32
        {
            journal.write_i32(BUCKETS_OFF, layout.bucket_count as i32);
            journal.write_i32(journal.layout.log_hdr_off + 16, log_cap as i32);
            journal.clear();
        }

        journal
    }

    /// Attaches a channel that receives a [`JournalEvent`] per successful
    /// [`set`](Journal::set).
    pub fn set_notify(&mut self, tx: UnboundedSender<JournalEvent>) {
        self.notify = Some(tx);
    }

    /// Resets the journal to empty. The data ring is left as-is; only the
    /// headers and bucket metadata are wiped.
    pub fn clear(&mut self) {
        self.write_i32(VERSION_OFF, MAP_VERSION);
        self.write_i32(HEAD_OFF, 0);
        self.write_i32(LENGTH_OFF, 0);

        let meta_end = self.layout.meta_off + 2 * self.layout.bucket_count as usize;
        self.buf[self.layout.meta_off..meta_end].fill(0);

        self.write_i32(self.layout.log_hdr_off, -1);
        self.write_i32(self.layout.log_hdr_off + 4, 0);
        self.write_i64(self.layout.log_hdr_off + 8, 1);
    }

    /// Inserts or updates `key`. Entries whose ring bytes the new record
    /// overlaps are evicted oldest-first. Returns [`JournalFull`] when no
    /// slot can be claimed.
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), JournalFull> {
        let hash = djb2(key.as_bytes());

        let (found, slot) = match self.probe_write(key.as_bytes(), hash) {
            WriteSlot::Full => return Err(JournalFull),
            WriteSlot::Found(slot) => (true, slot),
            WriteSlot::Reuse(slot) => {
                self.clear_tombstone(slot);
                (false, slot)
            }
            WriteSlot::Fresh(slot) => {
                self.bump_count(slot / 4);
                (false, slot)
            }
        };

        if found {
            // Unlink from the insertion-order cycle; it is re-linked as the
            // most recent entry below.
            let b = self.body(slot);
            self.set_body_next(b.prev_offset, b.next_offset);
            self.set_body_prev(b.next_offset, b.prev_offset);
            if self.head() == slot {
                self.set_head(b.next_offset);
            }
            if b.log_offset >= 0 {
                self.set_log_entry(b.log_offset, -1);
            }
        } else {
            if self.len() == 0 {
                self.set_head(slot);
            }
            self.write_i32(LENGTH_OFF, self.read_i32(LENGTH_OFF) + 1);
        }

        let head_prev = self.body(self.head()).prev_offset;
        self.set_body_next(head_prev, slot);
        let last = self.body(head_prev);

        let start = self.wrap(last.key_offset + last.key_size + last.value_size);

        let mut cur = self.body(slot);
        cur.key_offset = start;
        cur.key_size = key.len() as i32;
        cur.value_size = value.len() as i32;
        cur.prev_offset = head_prev;
        self.set_body(slot, cur);

        self.evict_overlapping(slot, start, cur.key_size + cur.value_size);

        let head = self.head();
        self.set_body_prev(head, slot);
        self.set_body_next(slot, head);

        self.ring_write(start, key.as_bytes());
        self.ring_write(self.wrap(start + cur.key_size), value);
        self.set_hash(slot, hash);

        let seq = self.log_append(slot);

        if let Some(tx) = &self.notify {
            let _ = tx.send(JournalEvent {
                key: key.to_string(),
                value: value.to_vec(),
                seq,
            });
        }

        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        let slot = match self.probe_read(key.as_bytes(), djb2(key.as_bytes())) {
            Some(slot) => slot,
            None => return false,
        };

        self.tombstone(slot);

        let b = self.body(slot);
        self.set_body_next(b.prev_offset, b.next_offset);
        self.set_body_prev(b.next_offset, b.prev_offset);
        if self.head() == slot {
            self.set_head(b.next_offset);
        }
        self.write_i32(LENGTH_OFF, self.read_i32(LENGTH_OFF) - 1);

        if b.log_offset >= 0 {
            self.set_log_entry(b.log_offset, -1);
        }

        true
    }

    /// Advances the insertion-order head past every entry whose ring bytes
    /// overlap the incoming record at `[start, start + len)`. Overlap is
    /// tested against both the contiguous and wrapped layouts of the new
    /// record.
    fn evict_overlapping(&mut self, slot: i32, start: i32, len: i32) {
        let data_len = self.layout.data_len as i32;

        loop {
            let head = self.head();
            if head == slot {
                return;
            }

            let h = self.body(head);
            let end = start + len;

            if end <= h.key_offset {
                return;
            }

            let head_end = h.key_offset + h.key_size + h.value_size;
            let no_overlap = if end > data_len {
                let wrapped_end = end - data_len;
                wrapped_end <= h.key_offset && head_end <= start
            } else {
                start >= head_end
            };
            if no_overlap {
                return;
            }

            self.tombstone(head);
            self.set_head(h.next_offset);
            if h.log_offset >= 0 {
                self.set_log_entry(h.log_offset, -1);
                self.set_body_log(head, -1);
            }
            self.write_i32(LENGTH_OFF, self.read_i32(LENGTH_OFF) - 1);
        }
    }

    /// Records `slot` in the circular log, rotating out the oldest record
    /// when the log is at capacity, and bumps the sequence counter.
    fn log_append(&mut self, slot: i32) -> i64 {
        let hdr = self.layout.log_hdr_off;
        let cap = self.log_cap();
        let mut tail = 0;

        if self.log_head() == -1 {
            self.write_i32(hdr, 0);
        } else if self.log_len() == cap {
            tail = self.log_head();

            let old_slot = self.log_entry(tail);
            if old_slot >= 0 {
                self.set_body_log(old_slot, -1);
            }

            let mut new_head = tail + 1;
            if new_head >= cap {
                new_head = 0;
            }
            self.write_i32(hdr, new_head);
        } else {
            tail = self.log_head() + self.log_len();
        }

        if tail >= cap {
            tail -= cap;
        }

        self.set_body_log(slot, tail);
        self.set_log_entry(tail, slot);

        if self.log_len() < cap {
            self.write_i32(hdr + 4, self.log_len() + 1);
        }

        let seq = self.seq() + 1;
        self.write_i64(hdr + 8, seq);
        seq
    }

    fn probe_write(&mut self, key: &[u8], hash: u64) -> WriteSlot {
        let buckets = self.layout.bucket_count as i32;
        let mut bucket = (hash % buckets as u64) as i32;
        let mut start_bucket = -1;
        let mut first_deleted: Option<i32> = None;

        while start_bucket != bucket {
            if start_bucket == -1 {
                start_bucket = bucket;
            }

            let (count, deleted) = self.meta(bucket);
            let bucket4 = bucket * 4;

            for slot in 0..count as i32 {
                if deleted & (1 << slot) != 0 {
                    if first_deleted.is_none() {
                        first_deleted = Some(bucket4 + slot);
                    }
                    continue;
                }
                if self.hash_at(bucket4 + slot) == hash && self.key_matches(bucket4 + slot, key) {
                    return WriteSlot::Found(bucket4 + slot);
                }
            }

            if (count as u32) < SLOTS_PER_BUCKET {
                return match first_deleted {
                    Some(slot) => WriteSlot::Reuse(slot),
                    None => WriteSlot::Fresh(bucket4 + count as i32),
                };
            }

            if deleted & OVERFLOW_BIT == 0 {
                if let Some(slot) = first_deleted {
                    return WriteSlot::Reuse(slot);
                }
                self.set_meta_deleted(bucket, deleted | OVERFLOW_BIT);
            }

            bucket += 1;
            if bucket == buckets {
                bucket = 0;
            }
        }

        match first_deleted {
            Some(slot) => WriteSlot::Reuse(slot),
            None => WriteSlot::Full,
        }
    }

    fn ring_write(&mut self, start: i32, bytes: &[u8]) {
        let data_off = self.layout.data_off;
        let data_len = self.layout.data_len;
        let start = start as usize;
        let data = &mut self.buf[data_off..];

        if start + bytes.len() > data_len {
            let first = data_len - start;
            data[start..data_len].copy_from_slice(&bytes[..first]);
            data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        } else {
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn write_i32(&mut self, off: usize, value: i32) {
        self.buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_i64(&mut self, off: usize, value: i64) {
        self.buf[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn set_head(&mut self, slot: i32) {
        self.write_i32(HEAD_OFF, slot);
    }

    fn set_hash(&mut self, slot: i32, hash: u64) {
        let off = self.layout.hash_off + 8 * slot as usize;
        self.buf[off..off + 8].copy_from_slice(&hash.to_ne_bytes());
    }

    fn set_body(&mut self, slot: i32, b: Body) {
        let off = self.layout.body_off + BODY_SIZE * slot as usize;
        self.write_i32(off, b.log_offset);
        self.write_i32(off + 4, b.key_offset);
        self.write_i32(off + 8, b.key_size);
        self.write_i32(off + 12, b.value_size);
        self.write_i32(off + 16, b.prev_offset);
        self.write_i32(off + 20, b.next_offset);
    }

    fn set_body_log(&mut self, slot: i32, value: i32) {
        self.write_i32(self.layout.body_off + BODY_SIZE * slot as usize, value);
    }

    fn set_body_prev(&mut self, slot: i32, value: i32) {
        self.write_i32(self.layout.body_off + BODY_SIZE * slot as usize + 16, value);
    }

    fn set_body_next(&mut self, slot: i32, value: i32) {
        self.write_i32(self.layout.body_off + BODY_SIZE * slot as usize + 20, value);
    }

    fn set_log_entry(&mut self, index: i32, value: i32) {
        self.write_i32(self.layout.log_data_off + 4 * index as usize, value);
    }

    fn tombstone(&mut self, slot: i32) {
        let off = self.layout.meta_off + 2 * (slot / 4) as usize + 1;
        self.buf[off] |= 1 << (slot % 4);
    }

    fn clear_tombstone(&mut self, slot: i32) {
        let off = self.layout.meta_off + 2 * (slot / 4) as usize + 1;
        self.buf[off] &= !(1 << (slot % 4));
    }

    fn bump_count(&mut self, bucket: i32) {
        let off = self.layout.meta_off + 2 * bucket as usize;
        self.buf[off] += 1;
    }

    fn set_meta_deleted(&mut self, bucket: i32, value: u8) {
        self.buf[self.layout.meta_off + 2 * bucket as usize + 1] = value;
    }
}

/// Insertion-order iterator returned by [`Journal::iter`].
pub struct JournalIter<'a, B> {
    journal: &'a Journal<B>,
    offset: i32,
}

impl<'a, B: Deref<Target = [u8]>> Iterator for JournalIter<'a, B> {
    type Item = (String, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let journal = self.journal;
        if journal.len() == 0 {
            return None;
        }

        if self.offset == -1 {
            self.offset = journal.head();
        } else if self.offset == journal.head() {
            return None;
        }

        let b = journal.body(self.offset);
        self.offset = b.next_offset;
        Some((journal.entry_key(b), journal.entry_value(b)))
    }
}

/// Write-log replay iterator returned by [`Journal::log_iter`].
pub struct JournalLogIter<'a, B> {
    journal: &'a Journal<B>,
    from: i64,
}

impl<'a, B: Deref<Target = [u8]>> Iterator for JournalLogIter<'a, B> {
    type Item = JournalEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let journal = self.journal;
        let seq = journal.seq();
        let log_len = journal.log_len() as i64;
        let log_cap = journal.log_cap() as i64;

        if self.from < seq - log_len {
            self.from = seq - log_len;
        }

        while self.from < seq {
            let mut offset = journal.log_head() as i64 + log_len - seq + self.from;
            if offset >= log_cap {
                offset -= log_cap;
            }

            let slot = journal.log_entry(offset as i32);
            if slot >= 0 {
                let b = journal.body(slot);
                let event = JournalEvent {
                    key: journal.entry_key(b),
                    value: journal.entry_value(b),
                    seq: self.from,
                };
                self.from += 1;
                return Some(event);
            }

            self.from += 1;
        }

        None
    }
}
