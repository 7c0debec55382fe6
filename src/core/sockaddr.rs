/*!
 * Socket Addresses
 * Wire form of the addresses taken by bind/connect and reported by accept
 */

use super::errors::{AgentError, Result};
use nix::sys::socket::{SockaddrLike, SockaddrStorage, UnixAddr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

/// Socket address carried over RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SockAddr {
    Inet(SocketAddr),
    /// Filesystem path of an AF_UNIX socket
    Unix(String),
    /// Unnamed socket or a family without a wire form
    Unspec,
}

impl SockAddr {
    /// Native storage for passing to the C primitives
    pub fn to_storage(&self) -> Result<SockaddrStorage> {
        match self {
            SockAddr::Inet(addr) => Ok(SockaddrStorage::from(*addr)),
            SockAddr::Unix(path) => {
                let unix = UnixAddr::new(path.as_str()).map_err(|e| AgentError::os("sockaddr_un", e))?;
                // SAFETY: as_ptr names a sockaddr_un of len() initialized bytes
                unsafe { SockaddrStorage::from_raw(unix.as_ptr().cast(), Some(unix.len())) }
                    .ok_or_else(|| AgentError::invalid_arg(format!("unusable unix address {}", path)))
            }
            SockAddr::Unspec => Err(AgentError::invalid_arg("unspecified socket address")),
        }
    }

    pub fn from_storage(storage: &SockaddrStorage) -> Self {
        if let Some(sin) = storage.as_sockaddr_in() {
            return SockAddr::Inet(SocketAddr::V4(SocketAddrV4::from(*sin)));
        }
        if let Some(sin6) = storage.as_sockaddr_in6() {
            return SockAddr::Inet(SocketAddr::V6(SocketAddrV6::from(*sin6)));
        }
        match storage.as_unix_addr().and_then(|unix| unix.path()) {
            Some(path) => SockAddr::Unix(path.to_string_lossy().into_owned()),
            None => SockAddr::Unspec,
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{}", addr),
            SockAddr::Unix(path) => write!(f, "unix:{}", path),
            SockAddr::Unspec => f.write_str("unspec"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet_through_storage() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let storage = SockAddr::Inet(addr).to_storage().unwrap();
        assert_eq!(storage.family(), Some(nix::sys::socket::AddressFamily::Inet));
        assert_eq!(SockAddr::from_storage(&storage), SockAddr::Inet(addr));

        let addr6: SocketAddr = "[::1]:80".parse().unwrap();
        let storage = SockAddr::Inet(addr6).to_storage().unwrap();
        assert_eq!(SockAddr::from_storage(&storage), SockAddr::Inet(addr6));
    }

    #[test]
    fn test_unix_path_and_unspec() {
        let storage = SockAddr::Unix("/tmp/agent.sock".into()).to_storage().unwrap();
        assert_eq!(SockAddr::from_storage(&storage), SockAddr::Unix("/tmp/agent.sock".into()));
        assert_eq!(SockAddr::Unix("/tmp/agent.sock".into()).to_string(), "unix:/tmp/agent.sock");
        assert!(SockAddr::Unspec.to_storage().is_err());
    }
}
