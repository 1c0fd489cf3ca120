use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// A transport endpoint. The transport protocol is carried by the `IpAddr` variant;
/// equality and hashing cover (protocol, host, port).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Address {
    pub host: IpAddr,
    pub port: u16,
}

impl Address {
    #[inline]
    pub fn new(host: IpAddr, port: u16) -> Address {
        Address { host, port }
    }

    #[inline]
    pub fn localhost(port: u16) -> Address {
        Address {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    #[inline]
    pub fn from_socket_addr(addr: SocketAddr) -> Address {
        Address {
            host: addr.ip(),
            port: addr.port(),
        }
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// True when the host matches, ignoring the port. Used to match punch packets that
    /// arrive from a NAT-rewritten port.
    #[inline]
    pub fn same_host(&self, other: &Address) -> bool {
        self.host == other.host
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        match self.host {
            IpAddr::V4(ip) => ip.is_unspecified(),
            IpAddr::V6(ip) => ip.is_unspecified(),
        }
    }

    /// Serialized form fed into the client identity hash.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match self.host {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        bytes
            .write_u16::<BigEndian>(self.port)
            .expect("vec write is infallible");
        bytes
    }

    /// FNV-1a hash used by the interface's open-addressed connection table.
    pub fn table_hash(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.to_bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash
    }
}

impl FromStr for Address {
    type Err = NetworkError;

    /// Accepts `host:port` with an optional `ip:` transport prefix, e.g.
    /// `ip:127.0.0.1:29000`.
    fn from_str(value: &str) -> NetworkResult<Address> {
        let trimmed = value.strip_prefix("ip:").unwrap_or(value);
        trimmed
            .parse::<SocketAddr>()
            .map(Address::from_socket_addr)
            .map_err(|_| NetworkError::Fatal(ErrorType::AddressMalformed))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ip:{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_prefix() {
        let a: Address = "ip:127.0.0.1:29000".parse().unwrap();
        let b: Address = "127.0.0.1:29000".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.port, 29000);
        assert_eq!(a.to_string(), "ip:127.0.0.1:29000");
    }

    #[test]
    fn test_parse_malformed() {
        let result = "ip:not-an-address".parse::<Address>();
        assert_eq!(
            result.unwrap_err(),
            NetworkError::Fatal(ErrorType::AddressMalformed)
        );
    }

    #[test]
    fn test_same_host_ignores_port() {
        let a = Address::localhost(28000);
        let b = Address::localhost(28001);
        assert!(a.same_host(&b));
        assert_ne!(a, b);
        assert_ne!(a.table_hash(), b.table_hash());
    }
}
