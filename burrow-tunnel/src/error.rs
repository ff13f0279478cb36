//! Session-level error taxonomy. Every failure a tunnel session can hit is
//! one of these; the accept loops log them and close the connection without
//! ever generating an HTTP error towards the client.

use std::{fmt, io};

use crate::http::HttpParseError;

#[derive(Debug)]
pub enum SessionError {
    /// Malformed HTTP on the outer or nested request.
    Parse(HttpParseError),
    /// Structurally valid but unsupported request.
    Protocol(ProtocolError),
    /// Dial, accept, read or write failure on a plain socket.
    Network(io::Error),
    /// TLS handshake or certificate failure.
    Tls(io::Error),
    /// A broken Brotli stream.
    Compression(io::Error),
}

#[derive(Debug)]
pub enum ProtocolError {
    UnsupportedMethod(String),
    UnsupportedScheme(String),
    InvalidTarget(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(error) => write!(f, "parse error: {error}"),
            Self::Protocol(error) => error.fmt(f),
            Self::Network(error) => write!(f, "network error: {error}"),
            Self::Tls(error) => write!(f, "tls error: {error}"),
            Self::Compression(error) => write!(f, "compression error: {error}"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMethod(method) => write!(f, "unsupported method {method}"),
            Self::UnsupportedScheme(scheme) => write!(f, "unsupported scheme {scheme}"),
            Self::InvalidTarget(target) => write!(f, "invalid target {target}"),
        }
    }
}

impl std::error::Error for SessionError {}
impl std::error::Error for ProtocolError {}

impl From<HttpParseError> for SessionError {
    fn from(error: HttpParseError) -> Self {
        SessionError::Parse(error)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(error: ProtocolError) -> Self {
        SessionError::Protocol(error)
    }
}
