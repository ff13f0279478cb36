//! Target address extraction from absolute URLs.

use url::Url;

use crate::error::ProtocolError;

/// A resolved tunnel target. `formatted` is the `host:port` form handed to
/// the dialer and to the nested `CONNECT` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub formatted: String,
}

impl TargetAddress {
    /// Parses an absolute URL. Ports default to 80 for `http` and 443 for
    /// `https`; other schemes must carry an explicit port.
    pub fn from_url(raw: &str) -> Result<TargetAddress, ProtocolError> {
        let url = Url::parse(raw).map_err(|_| ProtocolError::InvalidTarget(raw.to_string()))?;

        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => return Err(ProtocolError::InvalidTarget(raw.to_string())),
        };

        let port = match url.port_or_known_default() {
            Some(port) => port,
            None => return Err(ProtocolError::InvalidTarget(raw.to_string())),
        };

        Ok(TargetAddress {
            scheme: url.scheme().to_string(),
            formatted: format!("{host}:{port}"),
            host,
            port,
        })
    }
}

impl std::fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_by_scheme() {
        let address = TargetAddress::from_url("http://example.com/path").unwrap();
        assert_eq!(address.scheme, "http");
        assert_eq!(address.host, "example.com");
        assert_eq!(address.port, 80);
        assert_eq!(address.formatted, "example.com:80");

        let address = TargetAddress::from_url("https://example.com").unwrap();
        assert_eq!(address.port, 443);
        assert_eq!(address.formatted, "example.com:443");
    }

    #[test]
    fn explicit_port_wins() {
        let address = TargetAddress::from_url("http://example.com:8080/x?y=z").unwrap();
        assert_eq!(address.port, 8080);
        assert_eq!(address.formatted, "example.com:8080");
    }

    #[test]
    fn rejects_unparseable_targets() {
        assert!(TargetAddress::from_url("not a url").is_err());
        assert!(TargetAddress::from_url("gopher://example.com").is_err());
    }
}
