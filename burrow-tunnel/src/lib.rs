//! A two-endpoint transport that tunnels arbitrary TCP traffic through a
//! single Brotli-compressed, mutually-authenticated TLS 1.3 connection.
//!
//! The [`forwarder`] endpoint accepts plaintext HTTP proxy requests
//! (`CONNECT`, plus absolute-form `GET`/`POST`) from a local application,
//! opens a compressed TLS session to the [`server`] endpoint, and pumps the
//! original byte stream through it after a nested `CONNECT` handshake. The
//! server decompresses, resolves the nested target, and bridges to the
//! origin TCP endpoint.
//!
//! Neither endpoint is a conforming HTTP proxy: requests are parsed only far
//! enough to extract the target, and past the handshake the tunnel is
//! transport-transparent in both directions.

pub mod address;
pub mod app;
pub mod copy;
pub mod error;
pub mod forwarder;
pub mod http;
pub mod server;
pub mod socket;
pub mod tls;

/// The tunnel acknowledgement, written by whichever side terminates a
/// `CONNECT`, and skipped by byte count on the receiving side.
pub const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Size of the pooled copy buffers.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Seconds the server waits when dialing the origin endpoint.
pub const REMOTE_DIAL_TIMEOUT_SECS: u64 = 5;

/// Accept errors that leave the listener usable; everything else stops the
/// accept loop.
pub(crate) fn is_transient_accept_error(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused | ErrorKind::Interrupted
    )
}
