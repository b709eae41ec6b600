//! The listener endpoint grammar.
//!
//! A connection spec names where the MTA reaches the filter:
//!
//! ```text
//! spec    := "inet:"  PORT [ "@" HOST | "@[" ADDRESS "]" ]
//!          | "inet6:" PORT [ "@" HOST | "@[" ADDRESS "]" ]
//!          | "unix:"  PATH
//! ```
//!
//! Without a host part the wildcard address is bound. Invalid specs fail
//! before any socket is created.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;

use crate::error::Error;

lazy_static! {
    static ref INET_SPEC: Regex =
        Regex::new(r"^(inet6?):([0-9]{1,5})(?:@(?:\[([^\[\]]+)\]|([^\[\]@]+)))?$").unwrap();
}

/// A parsed listener endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Inet { port: u16, host: Option<String> },
    Inet6 { port: u16, host: Option<String> },
    Unix { path: PathBuf },
}

impl ConnectionSpec {
    /// Parse a spec string. Fails with [`Error::BadSpec`] on anything
    /// outside the grammar.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let bad = |reason: &str| Error::BadSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        if let Some(path) = spec.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(bad("empty socket path"));
            }
            return Ok(ConnectionSpec::Unix {
                path: PathBuf::from(path),
            });
        }

        let captures = INET_SPEC
            .captures(spec)
            .ok_or_else(|| bad("expected inet:PORT[@HOST], inet6:PORT[@HOST] or unix:PATH"))?;

        let port: u16 = captures[2]
            .parse()
            .map_err(|_| bad("port out of range"))?;
        if port == 0 {
            return Err(bad("port must be between 1 and 65535"));
        }

        let host = captures
            .get(3)
            .or_else(|| captures.get(4))
            .map(|m| m.as_str().to_string());

        match &captures[1] {
            "inet" => Ok(ConnectionSpec::Inet { port, host }),
            "inet6" => Ok(ConnectionSpec::Inet6 { port, host }),
            _ => unreachable!("the spec pattern admits no other scheme"),
        }
    }

    /// The host and port to bind, with the wildcard address filled in for
    /// host-less inet specs.
    pub(crate) fn bind_endpoint(&self) -> Option<(String, u16)> {
        match self {
            ConnectionSpec::Inet { port, host } => Some((
                host.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                *port,
            )),
            ConnectionSpec::Inet6 { port, host } => {
                Some((host.clone().unwrap_or_else(|| "::".to_string()), *port))
            }
            ConnectionSpec::Unix { .. } => None,
        }
    }

    pub(crate) fn unix_path(&self) -> Option<&PathBuf> {
        match self {
            ConnectionSpec::Unix { path } => Some(path),
            _ => None,
        }
    }
}

impl FromStr for ConnectionSpec {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        Self::parse(spec)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Inet { port, host: None } => write!(f, "inet:{}", port),
            ConnectionSpec::Inet {
                port,
                host: Some(host),
            } => write!(f, "inet:{}@{}", port, host),
            ConnectionSpec::Inet6 { port, host: None } => write!(f, "inet6:{}", port),
            ConnectionSpec::Inet6 {
                port,
                host: Some(host),
            } => write!(f, "inet6:{}@{}", port, host),
            ConnectionSpec::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_inet_without_host() {
        assert_eq!(
            ConnectionSpec::parse("inet:10025").unwrap(),
            ConnectionSpec::Inet {
                port: 10025,
                host: None
            }
        );
    }

    #[test]
    fn parses_inet_with_host() {
        assert_eq!(
            ConnectionSpec::parse("inet:10025@localhost").unwrap(),
            ConnectionSpec::Inet {
                port: 10025,
                host: Some("localhost".into())
            }
        );
    }

    #[test]
    fn parses_inet_with_bracketed_address() {
        assert_eq!(
            ConnectionSpec::parse("inet:8895@[192.0.2.1]").unwrap(),
            ConnectionSpec::Inet {
                port: 8895,
                host: Some("192.0.2.1".into())
            }
        );
    }

    #[test]
    fn parses_inet6_with_bracketed_address() {
        assert_eq!(
            ConnectionSpec::parse("inet6:8895@[::1]").unwrap(),
            ConnectionSpec::Inet6 {
                port: 8895,
                host: Some("::1".into())
            }
        );
    }

    #[test]
    fn parses_unix_path() {
        assert_eq!(
            ConnectionSpec::parse("unix:/var/run/filter.sock").unwrap(),
            ConnectionSpec::Unix {
                path: "/var/run/filter.sock".into()
            }
        );
    }

    #[test]
    fn wildcard_is_the_default_host() {
        let spec = ConnectionSpec::parse("inet:25").unwrap();
        assert_eq!(spec.bind_endpoint(), Some(("0.0.0.0".into(), 25)));

        let spec = ConnectionSpec::parse("inet6:25").unwrap();
        assert_eq!(spec.bind_endpoint(), Some(("::".into(), 25)));
    }

    #[test]
    fn rejects_port_zero() {
        assert_matches!(
            ConnectionSpec::parse("inet:0"),
            Err(Error::BadSpec { .. })
        );
    }

    #[test]
    fn rejects_port_above_u16() {
        assert_matches!(
            ConnectionSpec::parse("inet:70000"),
            Err(Error::BadSpec { .. })
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert_matches!(
            ConnectionSpec::parse("tcp:10025"),
            Err(Error::BadSpec { .. })
        );
    }

    #[test]
    fn rejects_empty_unix_path() {
        assert_matches!(ConnectionSpec::parse("unix:"), Err(Error::BadSpec { .. }));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert_matches!(
            ConnectionSpec::parse("inet:25@host@more"),
            Err(Error::BadSpec { .. })
        );
        assert_matches!(
            ConnectionSpec::parse("inet:25@"),
            Err(Error::BadSpec { .. })
        );
    }

    #[test]
    fn displays_round_trip() {
        for spec in &["inet:10025", "inet:10025@localhost", "inet6:25", "unix:/tmp/f.sock"] {
            assert_eq!(
                &ConnectionSpec::parse(spec).unwrap().to_string(),
                spec
            );
        }
    }
}
