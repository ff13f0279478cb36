//! Per-application shared state: the root cancellation token and the copy
//! buffer pool. Built once in `main` (or per test) and passed into the
//! endpoint loops; nothing here is a process-wide singleton.

use std::{cell::RefCell, rc::Rc};

use tokio_util::sync::CancellationToken;

use crate::BUFFER_SIZE;

/// Everything a session handler needs from the application: cancellation and
/// buffers. Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct AppContext {
    pub cancel: CancellationToken,
    pub buffers: BufferPool,
}

impl AppContext {
    pub fn new() -> AppContext {
        AppContext::default()
    }
}

/// A pool of [`BUFFER_SIZE`] byte buffers shared by every pump on the local
/// task set. Buffers return to the pool when their guard drops, on every
/// exit path.
#[derive(Clone, Default)]
pub struct BufferPool {
    free: Rc<RefCell<Vec<Box<[u8]>>>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool::default()
    }

    pub fn get(&self) -> PooledBuf {
        let buf = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());

        PooledBuf {
            pool: self.clone(),
            buf: Some(buf),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        self.free.borrow_mut().push(buf);
    }
}

/// A borrowed pool buffer; dereferences to `[u8]`.
pub struct PooledBuf {
    pool: BufferPool,
    buf: Option<Box<[u8]>>,
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.buf {
            Some(buf) => buf,
            None => &[],
        }
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.buf {
            Some(buf) => buf,
            None => Default::default(),
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new();

        let first = pool.get();
        let first_ptr = first.as_ptr();
        drop(first);

        let second = pool.get();
        assert_eq!(second.as_ptr(), first_ptr);
        assert_eq!(second.len(), BUFFER_SIZE);

        // Two live borrows means two distinct buffers.
        let third = pool.get();
        assert_ne!(second.as_ptr(), third.as_ptr());
    }
}
