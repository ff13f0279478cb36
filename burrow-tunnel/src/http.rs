//! A minimal HTTP/1.1 request-head parser: just enough to pull out the
//! method, URL, version and headers, and to hand back any body bytes that
//! were read past the header terminator.

use std::{
    collections::HashMap,
    fmt,
    io::{self},
};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    /// Header names are lowercased; values are kept verbatim.
    pub headers: HashMap<String, String>,
}

#[derive(Debug)]
pub enum HttpParseError {
    /// A line without CRLF termination, a bad request line, or a header
    /// without exactly one `": "` separator.
    MalformedHeader,
    /// More than [`MAX_HEADERS`] header lines.
    TooManyHeaders,
    /// The stream failed or ended mid-head.
    Io(io::Error),
}

impl fmt::Display for HttpParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader => write!(f, "malformed HTTP header"),
            Self::TooManyHeaders => write!(f, "exceeding max number of HTTP headers"),
            Self::Io(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for HttpParseError {}

impl From<io::Error> for HttpParseError {
    fn from(error: io::Error) -> Self {
        HttpParseError::Io(error)
    }
}

/// Reads one CRLF-terminated line, returning it without the terminator.
async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    line: &mut Vec<u8>,
) -> Result<String, HttpParseError> {
    line.clear();
    let n = reader.read_until(b'\n', line).await?;
    if n == 0 || line.last() != Some(&b'\n') {
        return Err(HttpParseError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-header",
        )));
    }

    if line.len() < 2 || line[line.len() - 2] != b'\r' {
        return Err(HttpParseError::MalformedHeader);
    }

    match std::str::from_utf8(&line[..line.len() - 2]) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => Err(HttpParseError::MalformedHeader),
    }
}

/// Parses a request head from `reader`. Bytes past the empty line stay
/// buffered in the reader; use [`take_buffered`] to splice them elsewhere.
pub async fn parse_request<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<HttpRequest, HttpParseError> {
    let mut line = Vec::new();

    let start_line = read_line(reader, &mut line).await?;
    let parts: Vec<&str> = start_line.split(' ').collect();
    if parts.len() != 3 {
        return Err(HttpParseError::MalformedHeader);
    }

    let (method, url, version) = (parts[0], parts[1], parts[2]);
    if method.is_empty() || url.is_empty() || !version.starts_with("HTTP/") {
        return Err(HttpParseError::MalformedHeader);
    }

    let mut headers = HashMap::new();
    loop {
        let header_line = read_line(reader, &mut line).await?;
        if header_line.is_empty() {
            break;
        }

        let parts: Vec<&str> = header_line.split(": ").collect();
        if parts.len() != 2 {
            return Err(HttpParseError::MalformedHeader);
        }

        headers.insert(parts[0].to_lowercase(), parts[1].to_string());
        if headers.len() > MAX_HEADERS {
            return Err(HttpParseError::TooManyHeaders);
        }
    }

    Ok(HttpRequest {
        method: method.to_string(),
        url: url.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Drains and returns whatever the reader has buffered past the parsed head,
/// so the raw stream can be reclaimed without losing bytes.
pub fn take_buffered<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Vec<u8> {
    let buffered = reader.buffer().to_vec();
    reader.consume(buffered.len());
    buffered
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(input: &[u8]) -> Result<(HttpRequest, Vec<u8>), HttpParseError> {
        let mut reader = BufReader::new(input);
        let request = parse_request(&mut reader).await?;
        let rest = take_buffered(&mut reader);
        Ok((request, rest))
    }

    #[tokio::test]
    async fn parses_connect_request() {
        let (request, rest) = parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(request.method, "CONNECT");
        assert_eq!(request.url, "example.com:443");
        assert_eq!(request.version, "HTTP/1.1");
        assert!(request.headers.is_empty());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn parses_headers_and_returns_body_bytes() {
        let input = b"POST http://host:8080/path HTTP/1.1\r\nHost: host\r\nContent-Length: 4\r\n\r\nbody";
        let (request, rest) = parse(input).await.unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "http://host:8080/path");
        assert_eq!(request.headers.get("host").map(String::as_str), Some("host"));
        assert_eq!(request.headers.get("content-length").map(String::as_str), Some("4"));
        assert_eq!(rest, b"body");
    }

    #[tokio::test]
    async fn rejects_missing_carriage_return() {
        let result = parse(b"GET http://host/ HTTP/1.1\nHost: host\r\n\r\n").await;
        assert!(matches!(result, Err(HttpParseError::MalformedHeader)));
    }

    #[tokio::test]
    async fn rejects_bad_header_separator() {
        let result = parse(b"GET http://host/ HTTP/1.1\r\nHost:host\r\n\r\n").await;
        assert!(matches!(result, Err(HttpParseError::MalformedHeader)));

        let result = parse(b"GET http://host/ HTTP/1.1\r\nHost: a: b\r\n\r\n").await;
        assert!(matches!(result, Err(HttpParseError::MalformedHeader)));
    }

    #[tokio::test]
    async fn rejects_bad_request_line() {
        for input in [
            b"GET HTTP/1.1\r\n\r\n".as_slice(),
            b"GET http://host/ NOPE\r\n\r\n".as_slice(),
            b" http://host/ HTTP/1.1\r\n\r\n".as_slice(),
        ] {
            assert!(matches!(parse(input).await, Err(HttpParseError::MalformedHeader)), "{input:?}");
        }
    }

    #[tokio::test]
    async fn rejects_too_many_headers() {
        let mut input = b"GET http://host/ HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            input.extend_from_slice(format!("x-header-{i}: v\r\n").as_bytes());
        }
        input.extend_from_slice(b"\r\n");

        assert!(matches!(parse(&input).await, Err(HttpParseError::TooManyHeaders)));
    }

    #[tokio::test]
    async fn rejects_truncated_head() {
        let result = parse(b"GET http://host/ HTTP/1.1\r\nHost: host\r\n").await;
        assert!(matches!(result, Err(HttpParseError::Io(_))));
    }
}
