//! # Boundary Adapters
//!
//! The pipeline talks to the outside world through two seams: the upper
//! protocol exchanging raw segments, and the lower transport exchanging
//! datagrams. Both are traits so the daemons can run over UDP in production
//! and over in-memory channels in tests.
//!
//! Receive calls poll: `Ok(None)` means the poll interval elapsed with no
//! data, so loops can check their exit flag; [`Error::TransportClosed`]
//! means the endpoint is gone for good.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use crate::codec::CodecOutcome;
use crate::error::{Error, Result};

/// Kernel receive buffer for the datagram socket. Coded bursts arrive
/// faster than the fill worker drains them on high-rate links.
const RECV_BUFFER_LEN: usize = 4 * 1024 * 1024;

/// Segment exchange with the protocol above (LTP, tunnel payload, test
/// harness). Senders read segments from it, receivers deliver into it.
pub trait UpperProtocol: Send + Sync {
    fn receive_segment(&self) -> Result<Option<Vec<u8>>>;
    /// Delivers one recovered segment, tagged with the decode outcome of
    /// the matrix that carried it.
    fn send_segment(&self, segment: &[u8], outcome: CodecOutcome) -> Result<()>;
}

/// Datagram exchange with the link below. The optional address carries
/// per-packet peers for feedback traffic.
pub trait LowerTransport: Send + Sync {
    fn send_packet(&self, packet: &[u8], dest: Option<SocketAddr>) -> Result<()>;
    fn receive_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, Option<SocketAddr>)>>;
}

/// UDP lower transport. One socket, cloned per worker that needs it.
pub struct UdpLowerTransport {
    socket: UdpSocket,
    dest: Option<SocketAddr>,
}

impl UdpLowerTransport {
    /// Binds with an enlarged kernel receive buffer and a read timeout of
    /// `poll` so receive loops stay interruptible.
    pub fn bind(local: SocketAddr, dest: Option<SocketAddr>, poll: Duration) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_LEN)?;
        socket.bind(&local.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(poll))?;
        Ok(UdpLowerTransport { socket, dest })
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(UdpLowerTransport {
            socket: self.socket.try_clone()?,
            dest: self.dest,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl LowerTransport for UdpLowerTransport {
    fn send_packet(&self, packet: &[u8], dest: Option<SocketAddr>) -> Result<()> {
        let dest = dest
            .or(self.dest)
            .ok_or_else(|| Error::Config("datagram transport has no destination".into()))?;
        self.socket.send_to(packet, dest)?;
        Ok(())
    }

    fn receive_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, Option<SocketAddr>)>> {
        match self.socket.recv_from(buf) {
            Ok((len, peer)) => Ok(Some((len, Some(peer)))),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// UDP upper protocol: one datagram per segment.
pub struct UdpUpperProtocol {
    socket: UdpSocket,
    dest: Option<SocketAddr>,
}

impl UdpUpperProtocol {
    pub fn bind(local: SocketAddr, dest: Option<SocketAddr>, poll: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(poll))?;
        Ok(UdpUpperProtocol { socket, dest })
    }
}

impl UpperProtocol for UdpUpperProtocol {
    fn receive_segment(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; crate::packet::MAX_PACKET_LEN];
        match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_segment(&self, segment: &[u8], outcome: CodecOutcome) -> Result<()> {
        if outcome != CodecOutcome::Success {
            debug!("delivering segment from a matrix that was {}", outcome);
        }
        let dest = self
            .dest
            .ok_or_else(|| Error::Config("upper protocol has no destination".into()))?;
        self.socket.send_to(segment, dest)?;
        Ok(())
    }
}

/// Channel-backed endpoints for tests and in-process composition.
pub mod mem {
    use super::*;

    /// Upper protocol over two channels: the harness injects segments and
    /// observes deliveries.
    pub struct MemUpperProtocol {
        inbound: Receiver<Vec<u8>>,
        outbound: Sender<(Vec<u8>, CodecOutcome)>,
        poll: Duration,
    }

    /// Harness half of [`MemUpperProtocol`].
    pub struct MemUpperHarness {
        pub segments: Sender<Vec<u8>>,
        pub deliveries: Receiver<(Vec<u8>, CodecOutcome)>,
    }

    pub fn upper_pair(poll: Duration) -> (MemUpperProtocol, MemUpperHarness) {
        let (segment_tx, segment_rx) = unbounded();
        let (delivery_tx, delivery_rx) = unbounded();
        (
            MemUpperProtocol {
                inbound: segment_rx,
                outbound: delivery_tx,
                poll,
            },
            MemUpperHarness {
                segments: segment_tx,
                deliveries: delivery_rx,
            },
        )
    }

    impl UpperProtocol for MemUpperProtocol {
        fn receive_segment(&self) -> Result<Option<Vec<u8>>> {
            match self.inbound.recv_timeout(self.poll) {
                Ok(segment) => Ok(Some(segment)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(Error::TransportClosed),
            }
        }

        fn send_segment(&self, segment: &[u8], outcome: CodecOutcome) -> Result<()> {
            self.outbound
                .send((segment.to_vec(), outcome))
                .map_err(|_| Error::TransportClosed)
        }
    }

    /// Lower transport over raw channel halves, so a harness can splice
    /// itself into the path and drop or reorder packets.
    pub struct MemLowerTransport {
        outbound: Sender<Vec<u8>>,
        inbound: Receiver<Vec<u8>>,
        poll: Duration,
    }

    impl MemLowerTransport {
        pub fn new(outbound: Sender<Vec<u8>>, inbound: Receiver<Vec<u8>>, poll: Duration) -> Self {
            MemLowerTransport {
                outbound,
                inbound,
                poll,
            }
        }
    }

    /// Two directly connected endpoints, lossless.
    pub fn datagram_link(poll: Duration) -> (MemLowerTransport, MemLowerTransport) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            MemLowerTransport::new(a_tx, b_rx, poll),
            MemLowerTransport::new(b_tx, a_rx, poll),
        )
    }

    impl LowerTransport for MemLowerTransport {
        fn send_packet(&self, packet: &[u8], _dest: Option<SocketAddr>) -> Result<()> {
            self.outbound
                .send(packet.to_vec())
                .map_err(|_| Error::TransportClosed)
        }

        fn receive_packet(&self, buf: &mut [u8]) -> Result<Option<(usize, Option<SocketAddr>)>> {
            match self.inbound.recv_timeout(self.poll) {
                Ok(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(Some((len, None)))
                }
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(Error::TransportClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem::*;
    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn mem_link_carries_packets_both_ways() {
        let (a, b) = datagram_link(POLL);
        a.send_packet(b"ping", None).unwrap();
        let mut buf = [0u8; 16];
        let (len, source) = b.receive_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert!(source.is_none());

        b.send_packet(b"pong", None).unwrap();
        let (len, _) = a.receive_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"pong");
    }

    #[test]
    fn mem_receive_times_out_as_idle() {
        let (a, _b) = datagram_link(POLL);
        let mut buf = [0u8; 16];
        assert!(a.receive_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn mem_link_reports_closure() {
        let (a, b) = datagram_link(POLL);
        drop(b);
        let mut buf = [0u8; 16];
        assert!(matches!(
            a.receive_packet(&mut buf),
            Err(Error::TransportClosed)
        ));
        assert!(matches!(
            a.send_packet(b"x", None),
            Err(Error::TransportClosed)
        ));
    }

    #[test]
    fn mem_upper_pair_tags_deliveries() {
        let (upper, harness) = upper_pair(POLL);
        harness.segments.send(b"segment".to_vec()).unwrap();
        assert_eq!(upper.receive_segment().unwrap().unwrap(), b"segment");
        assert!(upper.receive_segment().unwrap().is_none());

        upper
            .send_segment(b"recovered", CodecOutcome::Success)
            .unwrap();
        let (bytes, outcome) = harness.deliveries.recv_timeout(POLL).unwrap();
        assert_eq!(bytes, b"recovered");
        assert_eq!(outcome, CodecOutcome::Success);
    }

    #[test]
    fn udp_lower_roundtrip_with_timeout() {
        let a = UdpLowerTransport::bind("127.0.0.1:0".parse().unwrap(), None, POLL).unwrap();
        let b = UdpLowerTransport::bind("127.0.0.1:0".parse().unwrap(), None, POLL).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_packet(b"datagram", Some(b_addr)).unwrap();
        let mut buf = [0u8; 64];
        let (len, source) = b.receive_packet(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"datagram");
        assert_eq!(source.unwrap(), a.local_addr().unwrap());

        assert!(b.receive_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn udp_send_without_destination_is_a_config_error() {
        let a = UdpLowerTransport::bind("127.0.0.1:0".parse().unwrap(), None, POLL).unwrap();
        assert!(matches!(
            a.send_packet(b"x", None),
            Err(Error::Config(_))
        ));
    }
}
