//! The single-writer publishing pipeline: values are serialized on the
//! caller's task, queued, and assigned dense ids by one publish loop that
//! drives a [`Sender`].

use std::{
    io::{self, Error, ErrorKind},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::Sender;

struct QueuedItem<O> {
    data: Vec<u8>,
    opaque: O,
    ready: oneshot::Sender<io::Result<u64>>,
}

/// Sent on the optional delivery-report channel after each item's outcome is
/// known. `result` carries the assigned id on success.
#[derive(Debug)]
pub struct DeliveryReport<O> {
    pub opaque: O,
    pub result: io::Result<u64>,
}

/// Resolves once the publish loop has persisted (or failed) the item.
pub struct DeliveryHandle {
    ready: oneshot::Receiver<io::Result<u64>>,
}

impl DeliveryHandle {
    /// Waits for the item's outcome: the assigned id, or the publish error.
    pub async fn wait(self) -> io::Result<u64> {
        match self.ready.await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::BrokenPipe, "publish loop terminated")),
        }
    }
}

/// The enqueueing half. Cheap to clone and share across tasks.
pub struct Publisher<T, O> {
    serialize: Arc<dyn Fn(&T) -> io::Result<Vec<u8>> + Send + Sync>,
    queue: mpsc::Sender<QueuedItem<O>>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport<O>>>,
}

impl<T, O> Clone for Publisher<T, O> {
    fn clone(&self) -> Self {
        Publisher {
            serialize: Arc::clone(&self.serialize),
            queue: self.queue.clone(),
            reports: self.reports.clone(),
        }
    }
}

/// The draining half; [`run`](PublishLoop::run) it on its own task.
pub struct PublishLoop<S, O> {
    sender: S,
    queue: mpsc::Receiver<QueuedItem<O>>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport<O>>>,
}

/// Builds a publishing pipeline over `sender` with a bounded in-flight
/// queue. When `reports` is given, every item's outcome is also forwarded
/// there together with its opaque payload.
pub fn publisher<S, T, O>(
    sender: S,
    serialize: impl Fn(&T) -> io::Result<Vec<u8>> + Send + Sync + 'static,
    queue_size: usize,
    reports: Option<mpsc::UnboundedSender<DeliveryReport<O>>>,
) -> (Publisher<T, O>, PublishLoop<S, O>)
where
    S: Sender,
{
    let (queue_tx, queue_rx) = mpsc::channel(queue_size);

    (
        Publisher {
            serialize: Arc::new(serialize),
            queue: queue_tx,
            reports: reports.clone(),
        },
        PublishLoop {
            sender,
            queue: queue_rx,
            reports,
        },
    )
}

impl<T, O> Publisher<T, O> {
    /// Serializes `value` and enqueues it. Serialization failures resolve the
    /// returned handle (and the report channel) immediately without touching
    /// the queue.
    pub async fn send(&self, value: &T, opaque: O) -> DeliveryHandle {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = DeliveryHandle { ready: ready_rx };

        let data = match (self.serialize)(value) {
            Ok(data) => data,
            Err(error) => {
                self.report(opaque, Err(mirror_error(&error)));
                let _ = ready_tx.send(Err(error));
                return handle;
            }
        };

        let item = QueuedItem {
            data,
            opaque,
            ready: ready_tx,
        };
        if let Err(mpsc::error::SendError(item)) = self.queue.send(item).await {
            self.report(item.opaque, Err(Error::new(ErrorKind::BrokenPipe, "publish loop terminated")));
            let _ = item
                .ready
                .send(Err(Error::new(ErrorKind::BrokenPipe, "publish loop terminated")));
        }

        handle
    }

    fn report(&self, opaque: O, result: io::Result<u64>) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(DeliveryReport { opaque, result });
        }
    }
}

impl<S: Sender, O> PublishLoop<S, O> {
    /// Assigns ids starting at `sender.head() + 1` and persists queued items
    /// in order. A sender error is fatal: every queued item observes it and
    /// the loop returns.
    pub async fn run(mut self, cancel: CancellationToken) -> io::Result<()> {
        let mut id = self.sender.head() + 1;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = self.queue.recv() => item,
            };

            let item = match item {
                Some(item) => item,
                None => return Ok(()),
            };

            match self.sender.send(id, &item.data).await {
                Ok(()) => {
                    let _ = item.ready.send(Ok(id));
                    self.report(item.opaque, Ok(id));
                    id += 1;
                }
                Err(fatal) => {
                    error!(%fatal, "publish failed, terminating publish loop");

                    let _ = item.ready.send(Err(mirror_error(&fatal)));
                    self.report(item.opaque, Err(mirror_error(&fatal)));

                    // Everything already queued observes the same error.
                    while let Ok(queued) = self.queue.try_recv() {
                        let _ = queued.ready.send(Err(mirror_error(&fatal)));
                        self.report(queued.opaque, Err(mirror_error(&fatal)));
                    }

                    return Err(fatal);
                }
            }
        }
    }

    fn report(&self, opaque: O, result: io::Result<u64>) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(DeliveryReport { opaque, result });
        }
    }
}

/// An `io::Error` is not `Clone`; rebuild one with the same kind and text
/// for each additional observer.
fn mirror_error(error: &Error) -> Error {
    Error::new(error.kind(), error.to_string())
}
