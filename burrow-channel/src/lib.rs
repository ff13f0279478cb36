//! Durable at-least-once pub-sub between applications over a paged on-disk
//! message store.
//!
//! One process owns the store and runs a [`ChannelServer`]: a single writer
//! appends messages through a [`Publisher`], and any number of remote
//! [`Subscriber`]s stream them over TCP, acknowledging each message id.
//! Messages live in fixed-capacity pages (one index file plus one data file
//! per page); a page's files are deleted once every subscription has
//! acknowledged past it. Subscription cursors are persisted in a small
//! memory-mapped state file, so a restarted server resumes every subscriber
//! where it left off.
//!
//! All integers on disk and on the wire are native-endian; both endpoints
//! and the store are assumed to share one architecture.

mod memfile;
mod publisher;
mod server;
mod state;
mod subscriber;

pub use memfile::{AckHandle, Batch, Cursor, Memfile};
pub use publisher::{publisher, DeliveryHandle, DeliveryReport, PublishLoop, Publisher};
pub use server::ChannelServer;
pub use subscriber::{AckPending, Message, Subscriber};

use std::io;

/// Message ids per page. The first id of a page `p` is `p * INDEX_COUNT + 1`.
pub const INDEX_COUNT: u64 = 4 * 1024;

/// Size of one index file: `INDEX_COUNT` records of `{offset: u32, length: u32}`.
pub(crate) const INDEX_PAGE_SIZE: u64 = INDEX_COUNT * 8;

/// Size of the mmap'd state file holding the write head and all
/// subscription cursors.
pub(crate) const STATE_FILE_SIZE: usize = 4096;

/// Bytes prepended to each data-file record: `{id: u64, length: u32}`.
pub(crate) const RECORD_HEADER_SIZE: u32 = 12;

/// Keepalive period installed on subscriber and server connections.
pub(crate) const KEEPALIVE_SECS: u64 = 5;

/// Installs the channel keepalive on a connection, both sides of the wire.
pub(crate) fn set_keepalive(stream: &tokio::net::TcpStream, period: std::time::Duration) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))
}

/// The write side a [`PublishLoop`] drives: anything that can persist an
/// id'd payload and report the latest persisted id. [`ChannelServer`] is the
/// canonical implementation.
#[allow(async_fn_in_trait)]
pub trait Sender {
    /// The id of the most recently persisted message, 0 when none.
    fn head(&self) -> u64;

    /// Persists `data` under `id`. An error is fatal to the publish loop.
    async fn send(&self, id: u64, data: &[u8]) -> io::Result<()>;
}
