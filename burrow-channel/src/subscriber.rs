//! The remote subscriber: one TCP connection carrying framed messages
//! inbound and acknowledged ids outbound.

use std::{
    io::{self, Error, ErrorKind},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::KEEPALIVE_SECS;

const ACK_QUEUE_SIZE: usize = 100;

struct AckMessage {
    id: u64,
    ready: oneshot::Sender<io::Result<()>>,
}

/// Resolves once the acknowledgement has been written to the socket.
pub struct AckPending {
    ready: oneshot::Receiver<io::Result<()>>,
}

impl AckPending {
    pub async fn wait(self) -> io::Result<()> {
        match self.ready.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::BrokenPipe, "subscriber closed")),
        }
    }
}

/// A delivered message plus the handle to acknowledge it. Acknowledgements
/// may be issued in any order; the server only advances the durable cursor
/// when the oldest outstanding id is acknowledged.
pub struct Message<T> {
    data: T,
    id: u64,
    acks: mpsc::Sender<AckMessage>,
}

impl<T> Message<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    /// Queues the acknowledgement of this message's id.
    pub async fn ack(&self) -> AckPending {
        let (ready_tx, ready_rx) = oneshot::channel();
        let _ = self
            .acks
            .send(AckMessage {
                id: self.id,
                ready: ready_tx,
            })
            .await;
        // A failed enqueue drops ready_tx, which surfaces as BrokenPipe on
        // the pending handle.
        AckPending { ready: ready_rx }
    }
}

/// A connected, not-yet-running subscription.
pub struct Subscriber {
    stream: TcpStream,
    ack_tx: mpsc::Sender<AckMessage>,
    ack_rx: mpsc::Receiver<AckMessage>,
}

impl Subscriber {
    /// Connects to a channel server and announces the subscription `name`
    /// (ASCII, at most 255 bytes, no spaces).
    pub async fn connect(addr: &str, name: &str) -> io::Result<Subscriber> {
        if name.is_empty() || name.len() > 255 || !name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid subscription name"));
        }

        let mut stream = TcpStream::connect(addr).await?;
        crate::set_keepalive(&stream, Duration::from_secs(KEEPALIVE_SECS))?;

        stream.write_all(format!("SUB {name}\n").as_bytes()).await?;

        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_SIZE);
        Ok(Subscriber { stream, ack_tx, ack_rx })
    }

    /// Runs the read and acknowledgement loops until the server closes the
    /// connection, an error occurs, or `cancel` fires. Each received frame
    /// is passed through `deserialize` and forwarded to `out`.
    pub async fn run<T, D>(
        self,
        deserialize: D,
        out: mpsc::Sender<Message<T>>,
        cancel: CancellationToken,
    ) -> io::Result<()>
    where
        D: Fn(&[u8]) -> io::Result<T>,
    {
        let Subscriber { stream, ack_tx, mut ack_rx } = self;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let read_loop = async {
            loop {
                let mut header = [0u8; 12];
                match reader.read_exact(&mut header).await {
                    Ok(_) => {}
                    Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                    Err(error) => return Err(error),
                }

                let mut id_bytes = [0u8; 8];
                let mut length_bytes = [0u8; 4];
                id_bytes.copy_from_slice(&header[..8]);
                length_bytes.copy_from_slice(&header[8..]);
                let id = u64::from_ne_bytes(id_bytes);
                let length = u32::from_ne_bytes(length_bytes);

                let mut payload = vec![0u8; length as usize];
                reader.read_exact(&mut payload).await?;

                let data = deserialize(&payload)?;
                let message = Message {
                    data,
                    id,
                    acks: ack_tx.clone(),
                };
                if out.send(message).await.is_err() {
                    // The receiving side hung up; nothing left to deliver to.
                    return Ok(());
                }
            }
        };

        let ack_loop = async {
            while let Some(ack) = ack_rx.recv().await {
                match write_half.write_all(&ack.id.to_ne_bytes()).await {
                    Ok(()) => {
                        let _ = ack.ready.send(Ok(()));
                    }
                    Err(error) => {
                        let mirrored = Error::new(error.kind(), error.to_string());
                        let _ = ack.ready.send(Err(error));
                        return Err(mirrored);
                    }
                }
            }
            // All ack handles are gone; the queue is drained and closed.
            Ok(())
        };

        let result = tokio::select! {
            result = read_loop => result,
            result = ack_loop => result,
            _ = cancel.cancelled() => Ok(()),
        };

        debug!("subscriber loop finished");
        result
    }
}
