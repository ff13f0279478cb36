//! The mmap'd control block: global write head, earliest retained page, and
//! the packed table of subscription cursors.
//!
//! Layout, packed without padding, all native-endian:
//!
//! ```text
//! earliest_page: u64 | head: u64 | sub_count: i32 |
//! repeated { head: u64, key_size: i32, key_bytes }
//! ```

use std::{
    fs::{File, OpenOptions},
    io::{self, Error, ErrorKind},
    path::Path,
};

use memmap2::MmapMut;

use crate::STATE_FILE_SIZE;

const EARLIEST_PAGE_OFF: usize = 0;
const HEAD_OFF: usize = 8;
const SUB_COUNT_OFF: usize = 16;
const SUBS_OFF: usize = 20;
const SUB_HEADER_SIZE: usize = 12;

pub(crate) struct Subscription {
    pub key: String,
    head_off: usize,
}

pub(crate) struct State {
    mmap: MmapMut,
    _file: File,
    subs: Vec<Subscription>,
    end: usize,
}

impl State {
    /// Opens or creates the state file, maps it, and parses the subscription
    /// table. A freshly created file is zero-initialised by truncation.
    pub fn open(path: &Path) -> io::Result<State> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.set_len(STATE_FILE_SIZE as u64)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let mut state = State {
            mmap,
            _file: file,
            subs: Vec::new(),
            end: SUBS_OFF,
        };
        state.parse_subs()?;
        Ok(state)
    }

    fn parse_subs(&mut self) -> io::Result<()> {
        let count = self.read_i32(SUB_COUNT_OFF);
        let mut off = SUBS_OFF;

        for _ in 0..count {
            if off + SUB_HEADER_SIZE > STATE_FILE_SIZE {
                return Err(Error::new(ErrorKind::InvalidData, "subscription table overruns state file"));
            }

            let key_size = self.read_i32(off + 8) as usize;
            let key_end = off + SUB_HEADER_SIZE + key_size;
            if key_end > STATE_FILE_SIZE {
                return Err(Error::new(ErrorKind::InvalidData, "subscription key overruns state file"));
            }

            let key = String::from_utf8_lossy(&self.mmap[off + SUB_HEADER_SIZE..key_end]).into_owned();
            self.subs.push(Subscription { key, head_off: off });
            off = key_end;
        }

        self.end = off;
        Ok(())
    }

    pub fn head(&self) -> u64 {
        self.read_u64(HEAD_OFF)
    }

    pub fn set_head(&mut self, head: u64) {
        self.write_u64(HEAD_OFF, head);
    }

    pub fn earliest_page(&self) -> u64 {
        self.read_u64(EARLIEST_PAGE_OFF)
    }

    pub fn set_earliest_page(&mut self, page: u64) {
        self.write_u64(EARLIEST_PAGE_OFF, page);
    }

    pub fn sub_head(&self, index: usize) -> u64 {
        self.read_u64(self.subs[index].head_off)
    }

    pub fn set_sub_head(&mut self, index: usize, head: u64) {
        self.write_u64(self.subs[index].head_off, head);
    }

    /// The smallest cursor position across all subscriptions, 0 when there
    /// are none (or when some subscription has never advanced).
    pub fn min_sub_head(&self) -> u64 {
        let mut min = 0;
        for index in 0..self.subs.len() {
            let head = self.sub_head(index);
            if min == 0 || head < min {
                min = head;
            }
        }
        min
    }

    pub fn find_sub(&self, key: &str) -> Option<usize> {
        self.subs.iter().position(|sub| sub.key == key)
    }

    /// Returns the index and current cursor of the subscription named `key`,
    /// appending a new record at `head` when absent. Fails when the packed
    /// table would outgrow the state file.
    pub fn get_or_add_sub(&mut self, key: &str, head: u64) -> io::Result<(usize, u64)> {
        if let Some(index) = self.find_sub(key) {
            return Ok((index, self.sub_head(index)));
        }

        let off = self.end;
        if off + SUB_HEADER_SIZE + key.len() > STATE_FILE_SIZE {
            return Err(Error::new(ErrorKind::OutOfMemory, "subscription table full"));
        }

        self.write_u64(off, head);
        self.write_i32(off + 8, key.len() as i32);
        self.mmap[off + SUB_HEADER_SIZE..off + SUB_HEADER_SIZE + key.len()].copy_from_slice(key.as_bytes());

        self.subs.push(Subscription {
            key: key.to_string(),
            head_off: off,
        });
        self.end = off + SUB_HEADER_SIZE + key.len();

        let count = self.read_i32(SUB_COUNT_OFF);
        self.write_i32(SUB_COUNT_OFF, count + 1);

        Ok((self.subs.len() - 1, head))
    }

    fn read_i32(&self, off: usize) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.mmap[off..off + 4]);
        i32::from_ne_bytes(b)
    }

    fn write_i32(&mut self, off: usize, value: i32) {
        self.mmap[off..off + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.mmap[off..off + 8]);
        u64::from_ne_bytes(b)
    }

    fn write_u64(&mut self, off: usize, value: u64) {
        self.mmap[off..off + 8].copy_from_slice(&value.to_ne_bytes());
    }
}
