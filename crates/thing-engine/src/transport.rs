// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Transport abstraction for UDP, TCP and in-process channels.
//
// Transports carry whole protocol messages. Datagram transports map one
// datagram to one message; stream transports split the byte stream with
// protocol::frame_len.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::error::TransportError;
use crate::protocol;

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Link between the thing and its gateway.
pub trait Transport: Send {
    /// Send one message.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one message into `buf` without blocking.
    /// Returns `Ok(None)` when nothing is available.
    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;
}

/// Resolve `host:port` to the first socket address.
pub fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::Io(format!("cannot resolve {}", addr)))
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

/// UDP transport using `socket2`, connected to a single gateway.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `gateway`.
    pub fn connect(gateway: SocketAddr) -> Result<Self, TransportError> {
        let (domain, local): (socket2::Domain, SocketAddr) = if gateway.is_ipv6() {
            (socket2::Domain::IPV6, (std::net::Ipv6Addr::UNSPECIFIED, 0).into())
        } else {
            (socket2::Domain::IPV4, ([0, 0, 0, 0], 0).into())
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.bind(&local.into())?;
        socket.connect(&gateway.into())?;
        // Non-blocking so the net task can poll
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: socket.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.socket.send(data)?;
        Ok(())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from a previous send; the gateway may
            // simply not be up yet.
            Err(ref e) if e.kind() == ErrorKind::ConnectionRefused => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// TCP transport
// ---------------------------------------------------------------------------

/// TCP transport. Messages are delimited by their header length.
pub struct TcpTransport {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl TcpTransport {
    pub fn connect(gateway: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(gateway)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            rx: Vec::new(),
        })
    }

    /// Move the first complete message out of the receive buffer.
    fn take_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let Some(len) = protocol::frame_len(&self.rx) else {
            return Ok(None);
        };
        if len > buf.len() {
            self.rx.drain(..len);
            return Err(TransportError::FrameTooLarge(len));
        }
        buf[..len].copy_from_slice(&self.rx[..len]);
        self.rx.drain(..len);
        Ok(Some(len))
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        // Non-blocking stream: retry partial writes until done.
        let mut sent = 0;
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        if let Some(n) = self.take_frame(buf)? {
            return Ok(Some(n));
        }
        let mut chunk = [0u8; 512];
        match self.stream.read(&mut chunk) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                self.rx.extend_from_slice(&chunk[..n]);
                self.take_frame(buf)
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel transport
// ---------------------------------------------------------------------------

/// In-process transport over crossbeam channels.
///
/// [`ChannelTransport::pair`] returns two connected ends; tests use one as the
/// thing's transport and script the gateway on the other.
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }

    /// Blocking receive with a deadline, for test peers.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Vec<u8>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.rx.try_recv() {
            Ok(msg) => {
                let dst = buf
                    .get_mut(..msg.len())
                    .ok_or(TransportError::FrameTooLarge(msg.len()))?;
                dst.copy_from_slice(&msg);
                Ok(Some(msg.len()))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn recv_within(t: &mut dyn Transport, buf: &mut [u8]) -> Option<usize> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(n) = t.try_recv(buf).unwrap() {
                return Some(n);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_channel_pair() {
        let (mut a, mut b) = ChannelTransport::pair();
        let mut buf = [0u8; 8];
        assert_eq!(b.try_recv(&mut buf).unwrap(), None);

        a.send(&[0x15, 1, 0]).unwrap();
        assert_eq!(b.try_recv(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[0x15, 1, 0]);

        a.send(&[0u8; 9]).unwrap();
        assert_eq!(b.try_recv(&mut buf), Err(TransportError::FrameTooLarge(9)));

        drop(a);
        assert_eq!(b.try_recv(&mut buf), Err(TransportError::Closed));
    }

    #[test]
    fn test_udp_roundtrip() {
        let gateway = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut thing = UdpTransport::connect(gateway.local_addr().unwrap()).unwrap();

        thing.send(&[0x14, 0]).unwrap();
        let mut buf = [0u8; 64];
        gateway
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let (n, from) = gateway.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x14, 0]);

        gateway.send_to(&[0x15, 1, 0], from).unwrap();
        let n = recv_within(&mut thing, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x15, 1, 0]);
    }

    #[test]
    fn test_tcp_splits_stream_into_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut thing = TcpTransport::connect(listener.local_addr().unwrap()).unwrap();
        let (mut gateway, _) = listener.accept().unwrap();

        // Two messages in one write, the second split across writes.
        gateway.write_all(&[0x15, 1, 0, 0x21]).unwrap();
        gateway.flush().unwrap();

        let mut buf = [0u8; 64];
        let n = recv_within(&mut thing, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x15, 1, 0]);

        gateway.write_all(&[1, 0xFF]).unwrap();
        let n = recv_within(&mut thing, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x21, 1, 0xFF]);

        thing.send(&[0x12, 0]).unwrap();
        let mut got = [0u8; 2];
        gateway
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        gateway.read_exact(&mut got).unwrap();
        assert_eq!(got, [0x12, 0]);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:8884").unwrap(),
            "127.0.0.1:8884".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve("not an address").is_err());
    }
}
