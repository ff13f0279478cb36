//! The client-side endpoint: accepts plaintext proxy requests from local
//! applications and pumps each one through a compressed TLS session to the
//! remote server endpoint.

use std::{
    fmt::Write as _,
    io::{self, Error, ErrorKind},
    rc::Rc,
    sync::Arc,
};

use async_compression::tokio::{bufread::BrotliDecoder, write::BrotliEncoder};
use rustls::{pki_types::ServerName, ClientConfig};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::{
    address::TargetAddress,
    app::AppContext,
    copy::{self, report_pump},
    error::{ProtocolError, SessionError},
    http,
    socket::PollSocket,
    OK_RESPONSE,
};

/// The remote server endpoint every session connects to.
pub struct Remote {
    pub addr: String,
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl Remote {
    pub fn new(target: &TargetAddress, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Remote {
        Remote {
            addr: target.formatted.clone(),
            connector: TlsConnector::from(config),
            server_name,
        }
    }
}

/// Accepts local proxy connections until cancellation, spawning one session
/// task per connection.
pub async fn run_forwarder(listener: TcpListener, remote: Remote, ctx: AppContext) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, remote = %remote.addr, "forwarder listening");
    let remote = Rc::new(remote);

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

        let remote = Rc::clone(&remote);
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            match handle_connection(stream, remote, ctx).await {
                Ok(()) => {}
                Err(error) => debug!(%peer, %error, "session closed"),
            }
        });
    }
}

/// One full session: parse the local request, open the compressed TLS
/// session, run the nested `CONNECT` handshake, and pump both directions
/// until they complete.
async fn handle_connection(mut stream: TcpStream, remote: Rc<Remote>, ctx: AppContext) -> Result<(), SessionError> {
    let (request, leftover) = {
        let mut reader = BufReader::new(&mut stream);
        let request = http::parse_request(&mut reader).await?;
        let leftover = http::take_buffered(&mut reader);
        (request, leftover)
    };

    let is_connect = request.method == "CONNECT";
    let (target, init_data) = if is_connect {
        // The request URL already is `host:port`.
        (request.url.clone(), Vec::new())
    } else if request.method == "GET" || request.method == "POST" {
        let target = TargetAddress::from_url(&request.url)?;
        if target.scheme != "http" {
            return Err(ProtocolError::UnsupportedScheme(target.scheme).into());
        }

        // Replay the original request line and headers towards the origin.
        let mut init = String::new();
        let _ = write!(init, "{} {} {}\r\n", request.method, request.url, request.version);
        for (name, value) in &request.headers {
            let _ = write!(init, "{name}: {value}\r\n");
        }
        init.push_str("\r\n");

        (target.formatted, init.into_bytes())
    } else {
        return Err(ProtocolError::UnsupportedMethod(request.method.clone()).into());
    };

    info!(method = %request.method, url = %request.url, "connecting");

    let remote_stream = TcpStream::connect(&remote.addr).await.map_err(SessionError::Network)?;
    let tls_stream = remote
        .connector
        .connect(remote.server_name.clone(), remote_stream)
        .await
        .map_err(SessionError::Tls)?;
    let (tls_read, tls_write) = tokio::io::split(tls_stream);

    let (client_read, mut client_write) = stream.into_split();

    let (start_copy_tx, start_copy_rx) = oneshot::channel::<Result<OwnedWriteHalf, Error>>();

    let pool = ctx.buffers.clone();
    let connect_line = format!("CONNECT {target} HTTP/1.1\r\n\r\n");
    let upstream = tokio::task::spawn_local(async move {
        let mut encoder = BrotliEncoder::new(tls_write);
        let mut raw = PollSocket::new(client_read);

        let initial = [connect_line.as_bytes(), &init_data[..], &leftover[..]];
        let sent = copy::copy_from_raw(&mut encoder, &mut raw, &pool, &initial).await?;

        // Half-close towards the server: terminal Brotli block, close_notify
        // and FIN in one go.
        encoder.shutdown().await?;
        Ok(sent)
    });

    // A terminated CONNECT is acknowledged locally before any downstream
    // byte flows; the gate releases (or aborts) the downstream pump.
    if is_connect {
        match client_write.write_all(OK_RESPONSE).await {
            Ok(()) => {
                let _ = start_copy_tx.send(Ok(client_write));
            }
            Err(error) => {
                info!(%error, "failed to write ok response");
                let _ = start_copy_tx.send(Err(error));
            }
        }
    } else {
        let _ = start_copy_tx.send(Ok(client_write));
    }

    let downstream = tokio::task::spawn_local(async move {
        let mut client_write = match start_copy_rx.await {
            Ok(Ok(writer)) => writer,
            Ok(Err(error)) => return Err(error),
            Err(_) => return Err(Error::new(ErrorKind::BrokenPipe, "session aborted before start")),
        };

        let mut decoder = BrotliDecoder::new(BufReader::new(tls_read));
        let received = copy::copy_with_skip(&mut decoder, &mut client_write, OK_RESPONSE.len()).await?;
        let _ = client_write.shutdown().await;
        Ok(received)
    });

    let (up, down) = tokio::join!(upstream, downstream);
    report_pump("upstream", up, &ctx);
    report_pump("downstream", down, &ctx);

    Ok(())
}
