//! Network endpoint addresses
//!
//! A [`NetAddress`] is an IP and port. Its host string (the IP alone) is the
//! key used for banning and dial deduplication.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Address parsing errors
#[derive(Error, Debug)]
pub enum NetAddressError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
}

/// An IP endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Host string used as the ban and dial-dedup key
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether the address is a wildcard (0.0.0.0 or ::)
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// Resolve `host:port`, accepting hostnames as well as literal IPs
    pub async fn resolve(addr: &str) -> Result<Self, NetAddressError> {
        if let Ok(parsed) = addr.parse::<NetAddress>() {
            return Ok(parsed);
        }

        let mut addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| NetAddressError::Resolve {
                host: addr.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .next()
            .map(NetAddress::from)
            .ok_or_else(|| NetAddressError::Resolve {
                host: addr.to_string(),
                reason: "no addresses returned".to_string(),
            })
    }

    /// Open a TCP connection, failing after `timeout`
    pub async fn dial_timeout(&self, timeout: Duration) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(self.socket_addr())).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial {} timed out", self),
            )),
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for NetAddress {
    type Err = NetAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<SocketAddr>()
            .map(NetAddress::from)
            .map_err(|_| NetAddressError::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for NetAddress {
    type Error = NetAddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetAddress> for String {
    fn from(addr: NetAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
