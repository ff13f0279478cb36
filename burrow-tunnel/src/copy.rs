//! The concurrent copy engine: moves bytes between a raw socket and the
//! Brotli-framed TLS stream without deadlocking on either direction.

use std::io::{self};

use async_compression::tokio::write::BrotliEncoder;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinError,
};
use tracing::{debug, error};

use crate::{
    app::{AppContext, BufferPool},
    socket::{PollSocket, TryRead},
};

/// Pumps raw socket bytes into a Brotli writer.
///
/// Alternates between non-blocking and blocking reads: after a non-blocking
/// read comes up empty, any compressed output buffered since the last flush
/// is flushed so the peer sees interactive traffic promptly, and the next
/// read suspends. `initial` chunks are written ahead of the socket bytes.
///
/// Returns the total byte count moved. The encoder is left open; callers
/// decide when to emit the terminal block.
pub async fn copy_from_raw<W: AsyncWrite + Unpin>(
    dst: &mut BrotliEncoder<W>,
    src: &mut PollSocket,
    pool: &BufferPool,
    initial: &[&[u8]],
) -> io::Result<u64> {
    let mut buf = pool.get();
    let mut total = 0u64;
    let mut written_since_flush = 0usize;

    for chunk in initial {
        if chunk.is_empty() {
            continue;
        }
        dst.write_all(chunk).await?;
        written_since_flush += chunk.len();
        total += chunk.len() as u64;
    }

    let mut block_read = false;
    loop {
        let read = if block_read {
            match src.read(&mut buf).await? {
                0 => return Ok(total),
                n => n,
            }
        } else {
            match src.try_read(&mut buf)? {
                TryRead::Eof => return Ok(total),
                TryRead::Data(n) => n,
                TryRead::Empty => 0,
            }
        };

        if read > 0 {
            dst.write_all(&buf[..read]).await?;
            written_since_flush += read;
            total += read as u64;
        }

        block_read = read == 0;

        if read == 0 && written_since_flush > 0 {
            dst.flush().await?;
            written_since_flush = 0;
        }
    }
}

/// Copies `src` to `dst` after discarding exactly `skip` bytes; used to drop
/// the tunnel acknowledgement from the decompressed stream before handing
/// bytes to the client.
pub async fn copy_with_skip<R, W>(src: &mut R, dst: &mut W, skip: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if skip > 0 {
        let mut discard = vec![0u8; skip];
        src.read_exact(&mut discard).await?;
    }

    tokio::io::copy(src, dst).await
}

/// Logs a finished pump. A panicked pump triggers application shutdown; the
/// session itself just closes.
pub(crate) fn report_pump(direction: &'static str, result: Result<io::Result<u64>, JoinError>, ctx: &AppContext) {
    match result {
        Ok(Ok(bytes)) => debug!(direction, bytes, "pump finished"),
        Ok(Err(error)) => debug!(direction, %error, "pump failed"),
        Err(join_error) if join_error.is_panic() => {
            error!(direction, %join_error, "pump panicked, shutting down");
            ctx.cancel.cancel();
        }
        Err(join_error) => debug!(direction, %join_error, "pump aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::BrotliDecoder;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::LocalSet;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b.unwrap().0)
    }

    #[tokio::test]
    async fn flush_on_idle_delivers_before_close() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut app, raw) = tcp_pair().await;
                let (compressed_tx, compressed_rx) = tcp_pair().await;
                let pool = BufferPool::new();

                let pump = tokio::task::spawn_local(async move {
                    let mut encoder = BrotliEncoder::new(compressed_tx);
                    let mut src = PollSocket::new(raw.into_split().0);
                    let moved = copy_from_raw(&mut encoder, &mut src, &pool, &[b"hello "]).await?;
                    encoder.shutdown().await?;
                    Ok::<u64, io::Error>(moved)
                });

                let mut decoder = BrotliDecoder::new(BufReader::new(compressed_rx));

                // The raw side stays open; the pump must flush on idle for
                // these bytes to arrive at all.
                app.write_all(b"world").await.unwrap();
                let mut greeting = [0u8; 11];
                tokio::time::timeout(Duration::from_secs(5), decoder.read_exact(&mut greeting))
                    .await
                    .expect("flush-on-idle did not deliver")
                    .unwrap();
                assert_eq!(&greeting, b"hello world");

                // Closing the raw side ends the compressed stream.
                drop(app);
                let mut rest = Vec::new();
                decoder.read_to_end(&mut rest).await.unwrap();
                assert!(rest.is_empty());

                assert_eq!(pump.await.unwrap().unwrap(), 11);
            })
            .await;
    }

    #[tokio::test]
    async fn skip_drops_exactly_the_prefix() {
        let mut src: &[u8] = b"PREFIXpayload bytes";
        let mut dst = Vec::new();

        let copied = copy_with_skip(&mut src, &mut dst, 6).await.unwrap();
        assert_eq!(copied, 13);
        assert_eq!(dst, b"payload bytes");
    }

    #[tokio::test]
    async fn skip_fails_on_short_stream() {
        let mut src: &[u8] = b"tiny";
        let mut dst = Vec::new();

        let error = copy_with_skip(&mut src, &mut dst, 10).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn large_transfer_roundtrips() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (mut app, raw) = tcp_pair().await;
                let (compressed_tx, compressed_rx) = tcp_pair().await;
                let pool = BufferPool::new();

                let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

                let pump = tokio::task::spawn_local(async move {
                    let mut encoder = BrotliEncoder::new(compressed_tx);
                    let mut src = PollSocket::new(raw.into_split().0);
                    let moved = copy_from_raw(&mut encoder, &mut src, &pool, &[]).await?;
                    encoder.shutdown().await?;
                    Ok::<u64, io::Error>(moved)
                });

                let writer_payload = payload.clone();
                let writer = tokio::task::spawn_local(async move {
                    app.write_all(&writer_payload).await.unwrap();
                    drop(app);
                });

                let mut decoder = BrotliDecoder::new(BufReader::new(compressed_rx));
                let mut received = Vec::new();
                decoder.read_to_end(&mut received).await.unwrap();

                assert_eq!(received, payload);
                assert_eq!(pump.await.unwrap().unwrap(), 256 * 1024);
                writer.await.unwrap();
            })
            .await;
    }
}
