//! Listen address specifications.
//!
//! The gateway accepts `scheme://address` strings on the command line and in
//! the config file. Only `tcp` and `unix` are supported; a bare `host:port`
//! is treated as TCP and an empty string selects the default Unix socket.

use std::fmt;
use std::path::PathBuf;

use crate::{ConfigError, DEFAULT_TCP_HOST, DEFAULT_UNIX_SOCKET};

/// A parsed listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP socket on `host:port`.
    Tcp { host: String, port: u16 },
    /// Unix domain socket at the given path.
    Unix(PathBuf),
}

impl ListenAddr {
    /// Parse a `scheme://address` specification.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(ListenAddr::Unix(PathBuf::from(DEFAULT_UNIX_SOCKET)));
        }

        let (scheme, rest) = spec.split_once("://").unwrap_or(("tcp", spec));
        match scheme {
            "tcp" => parse_tcp(rest, spec),
            "unix" => parse_unix(rest, spec),
            _ => Err(ConfigError::InvalidAddress(spec.to_string())),
        }
    }

    /// The URL scheme of this address.
    pub fn scheme(&self) -> &'static str {
        match self {
            ListenAddr::Tcp { .. } => "tcp",
            ListenAddr::Unix(_) => "unix",
        }
    }
}

fn parse_tcp(rest: &str, spec: &str) -> Result<ListenAddr, ConfigError> {
    if rest.is_empty() || rest.contains("://") {
        return Err(ConfigError::InvalidAddress(spec.to_string()));
    }

    let parts: Vec<&str> = rest.split(':').collect();
    let [host, port] = parts.as_slice() else {
        return Err(ConfigError::InvalidAddress(spec.to_string()));
    };

    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(spec.to_string()))?;
    let host = if host.is_empty() {
        DEFAULT_TCP_HOST.to_string()
    } else {
        (*host).to_string()
    };

    Ok(ListenAddr::Tcp { host, port })
}

fn parse_unix(rest: &str, spec: &str) -> Result<ListenAddr, ConfigError> {
    if rest.contains("://") {
        return Err(ConfigError::InvalidAddress(spec.to_string()));
    }
    if rest.is_empty() {
        return Ok(ListenAddr::Unix(PathBuf::from(DEFAULT_UNIX_SOCKET)));
    }
    Ok(ListenAddr::Unix(PathBuf::from(rest)))
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_selects_default_unix_socket() {
        assert_eq!(
            ListenAddr::parse("  ").unwrap(),
            ListenAddr::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_tcp_with_host() {
        assert_eq!(
            ListenAddr::parse("tcp://0.0.0.0:2375").unwrap(),
            ListenAddr::Tcp {
                host: "0.0.0.0".to_string(),
                port: 2375
            }
        );
    }

    #[test]
    fn test_tcp_without_host_uses_loopback() {
        assert_eq!(
            ListenAddr::parse("tcp://:2376").unwrap(),
            ListenAddr::Tcp {
                host: "127.0.0.1".to_string(),
                port: 2376
            }
        );
    }

    #[test]
    fn test_missing_scheme_is_tcp() {
        let addr = ListenAddr::parse("localhost:4243").unwrap();
        assert_eq!(addr.scheme(), "tcp");
        assert_eq!(addr.to_string(), "tcp://localhost:4243");
    }

    #[test]
    fn test_tcp_rejects_malformed() {
        for bad in ["tcp://", "tcp://host", "tcp://a:b:c", "tcp://host:port", "tcp://h:70000"] {
            assert!(ListenAddr::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_unix_paths() {
        assert_eq!(
            ListenAddr::parse("unix:///run/berth.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/berth.sock"))
        );
        assert_eq!(
            ListenAddr::parse("unix://").unwrap(),
            ListenAddr::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_unix_rejects_nested_scheme() {
        assert!(ListenAddr::parse("unix://tcp://x").is_err());
    }

    #[test]
    fn test_unsupported_schemes_rejected() {
        assert!(matches!(
            ListenAddr::parse("fd://3"),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(ListenAddr::parse("udp://0.0.0.0:53").is_err());
    }

    #[test]
    fn test_display_unix() {
        let addr = ListenAddr::Unix(PathBuf::from("/tmp/x.sock"));
        assert_eq!(addr.to_string(), "unix:///tmp/x.sock");
    }
}
