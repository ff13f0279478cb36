//! The paged append-only message store.
//!
//! Every page owns two files named after the page number: an index file
//! (mmap'd, `INDEX_COUNT` fixed-width `{offset, length}` records) and an
//! append-only data file of `{id, length, payload}` records. One mutex
//! protects the write head, the current page handles and the waiter set;
//! subscriber cursors only take it for brief lookups.

use std::{
    collections::BTreeSet,
    fs::OpenOptions,
    io::{self, Error, ErrorKind, Write},
    mem,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{state::State, INDEX_COUNT, INDEX_PAGE_SIZE, RECORD_HEADER_SIZE};

/// One page's mmap'd index. The file handle is held for the mapping's
/// lifetime.
struct IndexPage {
    mmap: MmapMut,
    _file: std::fs::File,
}

impl IndexPage {
    fn entry(&self, slot: usize) -> (u32, u32) {
        let off = slot * 8;
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        a.copy_from_slice(&self.mmap[off..off + 4]);
        b.copy_from_slice(&self.mmap[off + 4..off + 8]);
        (u32::from_ne_bytes(a), u32::from_ne_bytes(b))
    }

    fn set_entry(&mut self, slot: usize, offset: u32, length: u32) {
        let off = slot * 8;
        self.mmap[off..off + 4].copy_from_slice(&offset.to_ne_bytes());
        self.mmap[off + 4..off + 8].copy_from_slice(&length.to_ne_bytes());
    }
}

fn open_index(dir: &Path, page: u64) -> io::Result<IndexPage> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dir.join(page.to_string()))?;
    file.set_len(INDEX_PAGE_SIZE)?;
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    Ok(IndexPage { mmap, _file: file })
}

fn create_data(dir: &Path, page: u64) -> io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(dir.join(page.to_string()))
}

struct Inner {
    state: State,
    index: IndexPage,
    data: std::fs::File,
    data_head: u32,
}

struct Shared {
    index_dir: PathBuf,
    data_dir: PathBuf,
    inner: Mutex<Inner>,
    notify: tokio::sync::Notify,
}

impl Shared {
    fn index_path(&self, page: u64) -> PathBuf {
        self.index_dir.join(page.to_string())
    }

    fn data_path(&self, page: u64) -> PathBuf {
        self.data_dir.join(page.to_string())
    }
}

/// The store handle. Cheap to clone; all clones share one write head and
/// one waiter set.
#[derive(Clone)]
pub struct Memfile {
    shared: Arc<Shared>,
}

impl Memfile {
    /// Opens the store rooted at the given directories, recovering the write
    /// head, current page and append offset from a previous run.
    pub fn open(index_dir: &Path, data_dir: &Path, state_file: &Path) -> io::Result<Memfile> {
        std::fs::create_dir_all(index_dir)?;
        std::fs::create_dir_all(data_dir)?;

        let state = State::open(state_file)?;
        let head = state.head();
        let current_page = if head > 0 { (head - 1) / INDEX_COUNT } else { 0 };

        let index = open_index(index_dir, current_page)?;
        let data = create_data(data_dir, current_page)?;

        let mut data_head = 0;
        if head != current_page * INDEX_COUNT {
            let slot = (head - 1 - current_page * INDEX_COUNT) as usize;
            let (offset, length) = index.entry(slot);
            data_head = offset + length;
        }

        Ok(Memfile {
            shared: Arc::new(Shared {
                index_dir: index_dir.to_path_buf(),
                data_dir: data_dir.to_path_buf(),
                inner: Mutex::new(Inner {
                    state,
                    index,
                    data,
                    data_head,
                }),
                notify: tokio::sync::Notify::new(),
            }),
        })
    }

    /// The id of the most recently published message.
    pub fn head(&self) -> u64 {
        self.shared.inner.lock().state.head()
    }

    /// The persisted cursor of a subscription, if it exists.
    pub fn subscription_head(&self, name: &str) -> Option<u64> {
        let inner = self.shared.inner.lock();
        let index = inner.state.find_sub(name)?;
        Some(inner.state.sub_head(index))
    }

    /// Registers (or resumes) the subscription `name`. New subscriptions
    /// start at the current head: they only see messages published after
    /// registration.
    pub fn register(&self, name: &str) -> io::Result<Cursor> {
        let mut inner = self.shared.inner.lock();
        let head = inner.state.head();
        let (sub_index, cursor_head) = inner.state.get_or_add_sub(name, head)?;

        Ok(Cursor {
            shared: Arc::clone(&self.shared),
            sub_index,
            head: cursor_head,
            data_file: None,
            tracker: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Publisher-side write path: garbage-collects fully-acknowledged pages,
    /// rolls the page over on the first id of a new page, appends the record
    /// and index entry, publishes the new head, and wakes every blocked
    /// cursor.
    pub fn add(&self, id: u64, data: &[u8]) -> io::Result<()> {
        let mut inner = self.shared.inner.lock();

        if inner.state.head() % INDEX_COUNT == 1 {
            self.collect_old_pages(&mut inner);
        }

        let mut old_page = None;
        if id != 1 && id % INDEX_COUNT == 1 {
            let page = (id - 1) / INDEX_COUNT;
            let index = open_index(&self.shared.index_dir, page)?;
            let data_file = create_data(&self.shared.data_dir, page)?;

            old_page = Some((
                mem::replace(&mut inner.index, index),
                mem::replace(&mut inner.data, data_file),
            ));
            inner.data_head = 0;
        }

        let slot = ((id - 1) % INDEX_COUNT) as usize;
        let record_len = data.len() as u32 + RECORD_HEADER_SIZE;
        let data_head = inner.data_head;
        inner.index.set_entry(slot, data_head, record_len);

        inner.data.write_all(&id.to_ne_bytes())?;
        inner.data.write_all(&(data.len() as u32).to_ne_bytes())?;
        inner.data.write_all(data)?;

        inner.data_head += record_len;
        inner.state.set_head(id);

        drop(inner);
        self.shared.notify.notify_waiters();

        // The previous page's mapping and handle are released only after the
        // new head is visible.
        drop(old_page);

        Ok(())
    }

    fn collect_old_pages(&self, inner: &mut Inner) {
        let min_sub_head = inner.state.min_sub_head();
        if min_sub_head == 0 {
            return;
        }

        let min_page_to_keep = (min_sub_head - 1) / INDEX_COUNT;
        for page in inner.state.earliest_page()..min_page_to_keep {
            debug!(page, "removing fully-acknowledged page");
            let _ = std::fs::remove_file(self.shared.index_path(page));
            let _ = std::fs::remove_file(self.shared.data_path(page));
        }

        if min_page_to_keep > inner.state.earliest_page() {
            inner.state.set_earliest_page(min_page_to_keep);
        }
    }
}

impl crate::Sender for Memfile {
    fn head(&self) -> u64 {
        Memfile::head(self)
    }

    async fn send(&self, id: u64, data: &[u8]) -> io::Result<()> {
        self.add(id, data)
    }
}

/// What [`Cursor::next`] hands the caller to read from.
#[derive(Debug)]
pub enum Batch<'a> {
    /// A byte range of the cursor's persistent data-file handle; read
    /// exactly `len` bytes.
    Bounded { file: &'a mut tokio::fs::File, len: u64 },
    /// A historical page's data file positioned at the first unread record;
    /// stream it to EOF and drop it.
    Stream { file: tokio::fs::File },
}

/// A subscription's reading position: the persistent committed offset lives
/// in the state file, the in-flight id tracker lives here.
pub struct Cursor {
    shared: Arc<Shared>,
    sub_index: usize,
    head: u64,
    data_file: Option<tokio::fs::File>,
    tracker: Arc<Mutex<BTreeSet<u64>>>,
}

enum Avail<'a> {
    Current { pub_head: u64, start: u32, len: u32 },
    Historical,
    Wait(Pin<Box<tokio::sync::futures::Notified<'a>>>),
}

impl Cursor {
    /// A handle for acknowledging delivered ids, usable concurrently with
    /// [`next`](Cursor::next).
    pub fn ack_handle(&self) -> AckHandle {
        AckHandle {
            shared: Arc::clone(&self.shared),
            tracker: Arc::clone(&self.tracker),
            sub_index: self.sub_index,
        }
    }

    /// Waits until messages beyond the cursor are available and returns a
    /// readable batch, marking every id in it as in-flight. Returns
    /// `ErrorKind::Interrupted` when `cancel` fires first.
    pub async fn next(&mut self, cancel: &CancellationToken) -> io::Result<Batch<'_>> {
        loop {
            let offset_page = self.head / INDEX_COUNT;

            let avail = {
                let inner = self.shared.inner.lock();
                let pub_head = inner.state.head();

                if pub_head > self.head {
                    let index_page = (pub_head - 1) / INDEX_COUNT;
                    let index_start = index_page * INDEX_COUNT + 1;

                    if offset_page == index_page {
                        let (start, _) = inner.index.entry((self.head + 1 - index_start) as usize);
                        let (end_off, end_len) = inner.index.entry((pub_head - index_start) as usize);
                        Avail::Current {
                            pub_head,
                            start,
                            len: end_off + end_len - start,
                        }
                    } else {
                        Avail::Historical
                    }
                } else {
                    // Register interest while still holding the lock so a
                    // publish between unlock and await cannot be missed.
                    let mut notified = Box::pin(self.shared.notify.notified());
                    notified.as_mut().enable();
                    Avail::Wait(notified)
                }
            };

            match avail {
                Avail::Wait(notified) => {
                    tokio::select! {
                        _ = notified => continue,
                        _ = cancel.cancelled() => {
                            return Err(Error::new(ErrorKind::Interrupted, "cancelled"));
                        }
                    }
                }
                Avail::Historical => {
                    // The requested page is no longer the current one: read
                    // its start offset from the on-disk index and stream the
                    // rest of the page.
                    self.data_file = None;

                    let mut index = tokio::fs::File::open(self.shared.index_path(offset_page)).await?;
                    index
                        .seek(io::SeekFrom::Start(8 * (self.head - offset_page * INDEX_COUNT)))
                        .await?;
                    let mut b = [0u8; 4];
                    index.read_exact(&mut b).await?;
                    drop(index);
                    let start = u32::from_ne_bytes(b);

                    let mut file = tokio::fs::File::open(self.shared.data_path(offset_page)).await?;
                    file.seek(io::SeekFrom::Start(start as u64)).await?;

                    let page_end = (offset_page + 1) * INDEX_COUNT;
                    self.track(self.head + 1, page_end);
                    self.head = page_end;

                    return Ok(Batch::Stream { file });
                }
                Avail::Current { pub_head, start, len } => {
                    if self.head % INDEX_COUNT == 0 {
                        // First read of a new page; the old handle is stale.
                        self.data_file = None;
                    }

                    let file = match self.data_file.take() {
                        Some(file) => file,
                        None => {
                            let mut file = tokio::fs::File::open(self.shared.data_path(offset_page)).await?;
                            file.seek(io::SeekFrom::Start(start as u64)).await?;
                            file
                        }
                    };

                    self.track(self.head + 1, pub_head);
                    self.head = pub_head;

                    let file = self.data_file.insert(file);
                    return Ok(Batch::Bounded { file, len: len as u64 });
                }
            }
        }
    }

    fn track(&self, from: u64, to: u64) {
        let mut tracker = self.tracker.lock();
        for id in from..=to {
            tracker.insert(id);
        }
    }
}

/// The acknowledgement half of a [`Cursor`].
pub struct AckHandle {
    shared: Arc<Shared>,
    tracker: Arc<Mutex<BTreeSet<u64>>>,
    sub_index: usize,
}

impl AckHandle {
    /// Acknowledges `id`. Untracked ids are ignored. The persisted cursor
    /// advances only when the oldest in-flight id is acknowledged; it then
    /// jumps to just before the next outstanding id (or to `id` itself when
    /// nothing is left in flight).
    pub fn ack(&self, id: u64) {
        let new_head = {
            let mut tracker = self.tracker.lock();
            let front = match tracker.first() {
                Some(front) => *front,
                None => return,
            };

            if !tracker.remove(&id) {
                return;
            }

            if front != id {
                return;
            }

            match tracker.first() {
                Some(next) => *next - 1,
                None => id,
            }
        };

        let mut inner = self.shared.inner.lock();
        inner.state.set_sub_head(self.sub_index, new_head);
    }
}
