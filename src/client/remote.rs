//! Remote repository addresses.
//!
//! Remotes are written `cof://host[:port]/path`. The host may be a name,
//! an IPv4 address or a bracketed IPv6 address; the port defaults to
//! [`DEFAULT_PORT`].

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::core::{CofError, DEFAULT_PORT, URL_SCHEME};

/// A parsed `cof://` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteUrl {
    host: String,
    port: u16,
    path: String,
}

impl RemoteUrl {
    /// Parse a `cof://host[:port]/path` URL.
    pub fn parse(url: &str) -> Result<Self, CofError> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| invalid(url, "expected cof:// scheme"))?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid(url, "unterminated IPv6 address"))?;
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid(url, "junk after IPv6 address"))?,
                ),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid(url, "missing host"));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(invalid(url, "invalid port")),
            },
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Repository path on the server, without the leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve the host to a socket address.
    pub async fn resolve(&self) -> Result<SocketAddr, CofError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .ok_or_else(|| CofError::Config(format!("no address found for host {}", self.host)))
    }
}

impl FromStr for RemoteUrl {
    type Err = CofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{URL_SCHEME}://[{}]:{}/{}", self.host, self.port, self.path)
        } else {
            write!(f, "{URL_SCHEME}://{}:{}/{}", self.host, self.port, self.path)
        }
    }
}

fn invalid(url: &str, reason: &str) -> CofError {
    CofError::Config(format!("invalid remote url {url:?}: {reason}"))
}
