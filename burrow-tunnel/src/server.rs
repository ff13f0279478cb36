//! The server-side endpoint: terminates the compressed TLS session, resolves
//! the nested `CONNECT` target, and bridges to the origin TCP endpoint.

use std::{
    io::{self, Error, ErrorKind},
    sync::Arc,
    time::Duration,
};

use async_compression::tokio::{bufread::BrotliDecoder, write::BrotliEncoder};
use rustls::ServerConfig;
use tokio::{
    io::{AsyncWriteExt, BufReader, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    app::AppContext,
    copy::{self, report_pump},
    error::{ProtocolError, SessionError},
    http,
    socket::PollSocket,
    OK_RESPONSE, REMOTE_DIAL_TIMEOUT_SECS,
};

type ServerTls = tokio_rustls::server::TlsStream<TcpStream>;

/// Accepts tunnel connections until cancellation, spawning one session task
/// per connection.
pub async fn run_server(listener: TcpListener, config: Arc<ServerConfig>, ctx: AppContext) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "tunnel server listening");
    let acceptor = TlsAcceptor::from(config);

    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(error) if crate::is_transient_accept_error(&error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
                Err(error) => {
                    warn!(%error, "stop listening");
                    return Err(error);
                }
            },
        };

        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            match handle_proxy(stream, acceptor, ctx).await {
                Ok(()) => {}
                Err(error) => debug!(%peer, %error, "session closed"),
            }
        });
    }
}

/// One full session: TLS accept, parse the nested `CONNECT` out of the
/// decompressed stream, dial the origin, acknowledge through the compressed
/// channel, and pump both directions until they complete.
async fn handle_proxy(stream: TcpStream, acceptor: TlsAcceptor, ctx: AppContext) -> Result<(), SessionError> {
    let tls_stream = acceptor.accept(stream).await.map_err(SessionError::Tls)?;
    let (tls_read, tls_write) = tokio::io::split(tls_stream);

    // Everything the client sends arrives Brotli-compressed; the parser and
    // the upstream pump read through one shared decoder.
    let mut reader = BufReader::new(BrotliDecoder::new(BufReader::new(tls_read)));
    let request = http::parse_request(&mut reader).await?;

    if request.method != "CONNECT" {
        return Err(ProtocolError::UnsupportedMethod(request.method.clone()).into());
    }

    info!(target = %request.url, "tunnel open");

    let dial = tokio::time::timeout(
        Duration::from_secs(REMOTE_DIAL_TIMEOUT_SECS),
        TcpStream::connect(&request.url),
    );
    let origin = match dial.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => return Err(SessionError::Network(error)),
        Err(_) => {
            return Err(SessionError::Network(Error::new(
                ErrorKind::TimedOut,
                "origin dial timed out",
            )))
        }
    };
    let (origin_read, mut origin_write) = origin.into_split();

    // Upstream: decompressed client bytes (any already-buffered ones first)
    // towards the origin.
    let upstream = tokio::task::spawn_local(async move {
        let sent = tokio::io::copy(&mut reader, &mut origin_write).await?;
        let _ = origin_write.shutdown().await;
        Ok(sent)
    });

    // The tunnel acknowledgement goes into the compressed channel before any
    // downstream byte; the gate then hands the writer to the downstream pump.
    let (start_copy_tx, start_copy_rx) = oneshot::channel::<Result<Encoder, Error>>();

    let mut encoder = BrotliEncoder::new(tls_write);
    match encoder.write_all(OK_RESPONSE).await {
        Ok(()) => {
            let _ = start_copy_tx.send(Ok(encoder));
        }
        Err(error) => {
            info!(%error, "failed to write ok response");
            let _ = start_copy_tx.send(Err(error));
        }
    }

    let pool = ctx.buffers.clone();
    let downstream = tokio::task::spawn_local(async move {
        let mut encoder = match start_copy_rx.await {
            Ok(Ok(encoder)) => encoder,
            Ok(Err(error)) => return Err(error),
            Err(_) => return Err(Error::new(ErrorKind::BrokenPipe, "session aborted before start")),
        };

        let mut raw = PollSocket::new(origin_read);
        let received = copy::copy_from_raw(&mut encoder, &mut raw, &pool, &[]).await?;

        // Half-close towards the client: terminal Brotli block, close_notify
        // and FIN in one go.
        encoder.shutdown().await?;
        Ok(received)
    });

    let (up, down) = tokio::join!(upstream, downstream);
    report_pump("upstream", up, &ctx);
    report_pump("downstream", down, &ctx);

    Ok(())
}

type Encoder = BrotliEncoder<WriteHalf<ServerTls>>;
