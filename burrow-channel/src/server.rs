//! The channel server: owns the message store and serves subscriber
//! connections over TCP.
//!
//! Each connection announces itself with a single `SUB <name>\n` line and
//! then runs two loops until either side closes: outbound message frames
//! driven by the subscription's cursor, and inbound acknowledged ids. Any
//! bytes a subscriber sent concatenated with its subscribe line are kept and
//! fed to the acknowledgement reader.

use std::{
    io::{self, Error, ErrorKind},
    path::Path,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    memfile::{AckHandle, Batch, Cursor, Memfile},
    Sender, KEEPALIVE_SECS,
};

/// `"SUB "` + 255 name bytes + `"\n"`.
const MAX_SUBSCRIBE_LINE: usize = 260;

/// A running channel endpoint: the [`Sender`] for a local publish loop and
/// the TCP frontend for remote subscribers.
#[derive(Clone)]
pub struct ChannelServer {
    memfile: Memfile,
}

impl ChannelServer {
    /// Opens (or creates) the message store.
    pub fn open(index_dir: &Path, data_dir: &Path, state_file: &Path) -> io::Result<ChannelServer> {
        Ok(ChannelServer {
            memfile: Memfile::open(index_dir, data_dir, state_file)?,
        })
    }

    /// The id of the most recently published message.
    pub fn head(&self) -> u64 {
        self.memfile.head()
    }

    /// The persisted cursor of a subscription, if it exists.
    pub fn subscription_head(&self, name: &str) -> Option<u64> {
        self.memfile.subscription_head(name)
    }

    /// Accepts subscriber connections until `cancel` fires. Transient accept
    /// errors are absorbed; anything else shuts the listener down.
    pub async fn run(&self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "channel server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(error) if is_transient_accept_error(&error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                    Err(error) => {
                        warn!(%error, "listener failed");
                        return Err(error);
                    }
                },
            };

            if let Err(error) = crate::set_keepalive(&stream, Duration::from_secs(KEEPALIVE_SECS)) {
                warn!(%peer, %error, "could not set keepalive");
            }

            let memfile = self.memfile.clone();
            let child_cancel = cancel.clone();
            tokio::spawn(async move {
                match handle_subscriber(memfile, stream, child_cancel).await {
                    Ok(()) => debug!(%peer, "subscriber connection closed"),
                    Err(error) => warn!(%peer, %error, "subscriber connection failed"),
                }
            });
        }
    }
}

impl Sender for ChannelServer {
    fn head(&self) -> u64 {
        self.memfile.head()
    }

    async fn send(&self, id: u64, data: &[u8]) -> io::Result<()> {
        self.memfile.add(id, data)
    }
}

fn is_transient_accept_error(error: &Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
    )
}

async fn handle_subscriber(memfile: Memfile, stream: TcpStream, cancel: CancellationToken) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::with_capacity(MAX_SUBSCRIBE_LINE, read_half);

    let mut line = Vec::new();
    {
        let mut limited = (&mut reader).take(MAX_SUBSCRIBE_LINE as u64);
        limited.read_until(b'\n', &mut line).await?;
    }

    if line.last() != Some(&b'\n') {
        return Err(Error::new(ErrorKind::InvalidData, "subscribe line missing terminator"));
    }
    line.pop();

    let text = std::str::from_utf8(&line)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "subscribe line is not valid ASCII"))?;
    let name = match text.strip_prefix("SUB ") {
        Some(name) if !name.is_empty() && !name.contains(' ') => name,
        _ => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("invalid subscribe command {text:?}"),
            ))
        }
    };

    let mut cursor = memfile.register(name)?;
    let acker = cursor.ack_handle();
    debug!(%peer, name, "subscriber registered");

    // `reader` still holds anything that followed the subscribe line; the
    // acknowledgement loop picks up from there.
    tokio::select! {
        result = read_acks(reader, acker) => result,
        result = send_batches(&mut cursor, write_half, &cancel) => result,
        _ = cancel.cancelled() => Ok(()),
    }
}

async fn read_acks(mut reader: tokio::io::BufReader<OwnedReadHalf>, acker: AckHandle) -> io::Result<()> {
    let mut buf = [0u8; 8];
    loop {
        match reader.read_exact(&mut buf).await {
            Ok(_) => acker.ack(u64::from_ne_bytes(buf)),
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}

async fn send_batches(cursor: &mut Cursor, mut writer: OwnedWriteHalf, cancel: &CancellationToken) -> io::Result<()> {
    loop {
        match cursor.next(cancel).await {
            Ok(Batch::Bounded { file, len }) => {
                let mut bounded = file.take(len);
                tokio::io::copy(&mut bounded, &mut writer).await?;
            }
            Ok(Batch::Stream { mut file }) => {
                tokio::io::copy(&mut file, &mut writer).await?;
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}
