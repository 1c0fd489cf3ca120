use crate::address::Address;
use crate::support::NetworkResult;
use mio::net::UdpSocket;
use std::io;

/// Non-blocking UDP endpoint. The engine is tick-driven, so no readiness polling is
/// needed; the interface drains `recv_from` until it reports no data each tick.
pub struct Socket {
    socket: UdpSocket,
    bound: Address,
}

impl Socket {
    /// Binds a non-blocking UDP socket to the supplied address. Binding to port 0
    /// selects an ephemeral port, reported by `bound_address`.
    pub fn bind(address: &Address) -> NetworkResult<Socket> {
        let socket = UdpSocket::bind(address.socket_addr())?;
        let bound = Address::from_socket_addr(socket.local_addr()?);
        Ok(Socket { socket, bound })
    }

    /// Sends a datagram. The OS either queues it or reports an error; this never blocks.
    #[inline]
    pub fn send_to(&self, address: &Address, data: &[u8]) -> NetworkResult<usize> {
        self.socket
            .send_to(data, address.socket_addr())
            .map_err(Into::into)
    }

    /// Receives one datagram if any is queued. Returns `None` when the socket is empty.
    #[inline]
    pub fn recv_from(&self, buf: &mut [u8]) -> NetworkResult<Option<(Address, usize)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => Ok(Some((Address::from_socket_addr(addr), size))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[inline]
    pub fn bound_address(&self) -> &Address {
        &self.bound
    }

    /// Addresses this socket can be reached at, for self-identification. A wildcard
    /// bind is reported as the loopback host on the bound port.
    pub fn interface_addresses(&self) -> Vec<Address> {
        if self.bound.is_wildcard() {
            vec![Address::localhost(self.bound.port)]
        } else {
            vec![self.bound]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_send_recv_roundtrip() {
        let a = Socket::bind(&Address::localhost(0)).unwrap();
        let b = Socket::bind(&Address::localhost(0)).unwrap();

        a.send_to(b.bound_address(), b"punch").unwrap();

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..100 {
            if let Some((from, size)) = b.recv_from(&mut buf).unwrap() {
                received = Some((from, buf[..size].to_vec()));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (from, data) = received.expect("datagram did not arrive on loopback");
        assert_eq!(&data[..], b"punch");
        assert_eq!(from.port, a.bound_address().port);
    }

    #[test]
    fn test_empty_socket_reports_no_data() {
        let socket = Socket::bind(&Address::localhost(0)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(socket.recv_from(&mut buf).unwrap(), None);
    }
}
