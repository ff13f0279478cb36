//! A thin polling wrapper over the read half of a TCP connection,
//! distinguishing "no data right now" from end-of-stream.

use std::io::{self, ErrorKind};

use tokio::{io::AsyncReadExt, net::tcp::OwnedReadHalf};

/// Outcome of a non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRead {
    /// That many bytes were read.
    Data(usize),
    /// The socket has nothing buffered right now.
    Empty,
    /// The peer closed its write side.
    Eof,
}

pub struct PollSocket {
    half: OwnedReadHalf,
}

impl PollSocket {
    pub fn new(half: OwnedReadHalf) -> PollSocket {
        PollSocket { half }
    }

    /// Reads at least one byte, suspending until the socket is readable.
    /// Returns 0 on end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.half.read(buf).await
    }

    /// A single non-blocking read attempt. Interrupted reads are retried;
    /// would-block becomes [`TryRead::Empty`].
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<TryRead> {
        loop {
            match self.half.try_read(buf) {
                Ok(0) => return Ok(TryRead::Eof),
                Ok(n) => return Ok(TryRead::Data(n)),
                Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(TryRead::Empty),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
    }
}
