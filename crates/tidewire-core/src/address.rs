//! Endpoint addressing
//!
//! Services and connections are addressed by URIs. Several schemes are
//! recognised so that configuration can name them, but only `tcp`, `ws` and
//! `wss` are carried by this transport layer.

use core::fmt;
use core::str::FromStr;
use std::net::SocketAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::{Host, Url};

use crate::errors::AddressError;

// ----------------------------------------------------------------------------
// Scheme
// ----------------------------------------------------------------------------

/// URI scheme tokens understood by the address parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Tcp,
    Udp,
    Http,
    Https,
    Ws,
    Wss,
    File,
    Ftp,
    Ldap,
    Mailto,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Udp => "udp",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::File => "file",
            Scheme::Ftp => "ftp",
            Scheme::Ldap => "ldap",
            Scheme::Mailto => "mailto",
        }
    }

    /// Whether this scheme maps onto the streaming transport layer
    pub fn is_streaming(self) -> bool {
        matches!(self, Scheme::Tcp | Scheme::Ws | Scheme::Wss)
    }

    /// Whether this scheme is carried over WebSocket frames
    pub fn is_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Scheme::Tcp),
            "udp" => Ok(Scheme::Udp),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            "file" => Ok(Scheme::File),
            "ftp" => Ok(Scheme::Ftp),
            "ldap" => Ok(Scheme::Ldap),
            "mailto" => Ok(Scheme::Mailto),
            other => Err(AddressError::UnknownScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// A parsed endpoint URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    url: Url,
    scheme: Scheme,
}

impl Endpoint {
    /// Parse an endpoint URI such as `tcp://127.0.0.1:9000`
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let url = Url::parse(input).map_err(|e| AddressError::Invalid {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        let scheme = url.scheme().parse()?;
        Ok(Self { url, scheme })
    }

    /// Build an endpoint for a socket address
    pub fn from_socket_addr(scheme: Scheme, addr: SocketAddr) -> Result<Self, AddressError> {
        Self::parse(&format!("{}://{}", scheme, addr))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Explicit port, falling back to the scheme default for ws/wss
    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    /// Fail unless this endpoint is served by the streaming transport
    pub fn ensure_streaming(&self) -> Result<(), AddressError> {
        if self.scheme.is_streaming() {
            Ok(())
        } else {
            Err(AddressError::UnsupportedScheme {
                scheme: self.scheme.to_string(),
            })
        }
    }

    /// Resolve host and port to a socket address
    pub async fn resolve(&self) -> Result<SocketAddr, AddressError> {
        let missing = || AddressError::MissingHostOrPort {
            input: self.url.to_string(),
        };
        let port = self.port().ok_or_else(missing)?;
        match self.url.host().ok_or_else(missing)? {
            Host::Ipv4(ip) => Ok(SocketAddr::from((ip, port))),
            Host::Ipv6(ip) => Ok(SocketAddr::from((ip, port))),
            Host::Domain(domain) => {
                let mut addrs = tokio::net::lookup_host((domain, port)).await.map_err(|e| {
                    AddressError::Invalid {
                        input: self.url.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                addrs.next().ok_or_else(missing)
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Endpoint::parse(&text).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let ep = Endpoint::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(ep.scheme(), Scheme::Tcp);
        assert_eq!(ep.host(), Some("127.0.0.1"));
        assert_eq!(ep.port(), Some(9000));
        assert!(ep.ensure_streaming().is_ok());
    }

    #[test]
    fn test_ws_default_port() {
        let ep = Endpoint::parse("ws://localhost/feed").unwrap();
        assert!(ep.scheme().is_websocket());
        assert_eq!(ep.port(), Some(80));
    }

    #[test]
    fn test_non_streaming_schemes() {
        for input in ["udp://10.0.0.1:53", "https://example.com", "mailto:ops@example.com", "file:///tmp/x"] {
            let ep = Endpoint::parse(input).unwrap();
            assert!(ep.ensure_streaming().is_err(), "{input}");
        }
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(matches!(
            Endpoint::parse("gopher://old.example:70"),
            Err(AddressError::UnknownScheme { .. })
        ));
        assert!(matches!(
            Endpoint::parse("not a uri"),
            Err(AddressError::Invalid { .. })
        ));
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let ep = Endpoint::from_socket_addr(Scheme::Tcp, addr).unwrap();
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:4242");
    }

    #[tokio::test]
    async fn test_resolve_literal_ip() {
        let ep = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let addr = ep.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:0".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_without_port_fails() {
        let ep = Endpoint::parse("tcp://127.0.0.1").unwrap();
        assert!(matches!(
            ep.resolve().await,
            Err(AddressError::MissingHostOrPort { .. })
        ));
    }
}
