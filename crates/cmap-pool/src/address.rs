//! Server endpoint addressing.

use std::fmt;
use std::str::FromStr;

use crate::error::PoolError;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 27017;

/// A resolved server endpoint.
///
/// A pool manages connections to exactly one address; every connection it
/// creates inherits it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Create an address from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host name or IP literal (IPv6 without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = PoolError;

    /// Parses `host`, `host:port` and `[v6-literal]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PoolError::InvalidAddress("address cannot be empty".into()));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PoolError::InvalidAddress(format!("unterminated '[' in {s}")))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(PoolError::InvalidAddress(format!(
                            "unexpected characters after ']' in {s}"
                        )));
                    }
                },
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(PoolError::InvalidAddress(format!(
                        "IPv6 literal must be bracketed: {s}"
                    )));
                }
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(PoolError::InvalidAddress(format!("missing host in {s}")));
        }

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| PoolError::InvalidAddress(format!("invalid port: {port}")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ServerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for ServerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only() {
        let addr: ServerAddress = "db.example.com".parse().unwrap();
        assert_eq!(addr.host(), "db.example.com");
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_host_port() {
        let addr: ServerAddress = "localhost:27018".parse().unwrap();
        assert_eq!(addr, ServerAddress::new("localhost", 27018));
        assert_eq!(addr.to_string(), "localhost:27018");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: ServerAddress = "[::1]:4000".parse().unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.port(), 4000);
        assert_eq!(addr.to_string(), "[::1]:4000");

        let addr: ServerAddress = "[fe80::1]".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<ServerAddress>().is_err());
        assert!(":27017".parse::<ServerAddress>().is_err());
        assert!("host:notaport".parse::<ServerAddress>().is_err());
        assert!("::1:27017".parse::<ServerAddress>().is_err());
        assert!("[::1".parse::<ServerAddress>().is_err());
        assert!("[::1]x".parse::<ServerAddress>().is_err());
    }
}
