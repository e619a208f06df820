use crate::tftp::{MalformedPacket, Packet, MAX_PACKET_SIZE};
use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

// Attempts at a random port in the configured range before settling for an OS-assigned one.
const RANDOM_BIND_ATTEMPTS: usize = 16;

// Big enough that an oversized datagram is seen whole and rejected rather than truncated into
// something that looks valid.
const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE * 2;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(SocketAddr, MalformedPacket),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(src, e) => write!(f, "Packet from {} not understood: {}", src, e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that encodes and parses TFTP packets, so the rest of the crate
/// deals only in structured packets and peer addresses.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds an OS-assigned port on the unspecified address of the same family as `peer`.
    pub fn bind_ephemeral_for(peer: SocketAddr) -> TftpResult<TftpSocket> {
        TftpSocket::bind(unspecified_for(peer, 0))
    }

    /// Binds a random port from `range` for talking to `peer`, falling back to an OS-assigned
    /// port if no attempt succeeds.
    pub fn bind_random_for(peer: SocketAddr, range: &RangeInclusive<u16>) -> TftpResult<TftpSocket> {
        if !range.is_empty() {
            let mut rng = rand::thread_rng();
            for _ in 0..RANDOM_BIND_ATTEMPTS {
                let port = rng.gen_range(range.clone());
                match TftpSocket::bind(unspecified_for(peer, port)) {
                    Ok(sock) => return Ok(sock),
                    Err(e) => log::debug!("Couldn't bind port {port}: {e}"),
                }
            }
            log::warn!("No free port in {:?}, using an ephemeral one", range);
        }
        TftpSocket::bind_ephemeral_for(peer)
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.to_bytes();
        self.sock.send_to(&buf, dst).await?;
        Ok(())
    }

    /// Waits for the next datagram without a deadline.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        match Packet::parse_from_buf(&buf[..total_written]) {
            Ok(packet) => Ok((packet, src)),
            Err(e) => Err(SocketError::PacketParse(src, e)),
        }
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}

fn unspecified_for(peer: SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
    }
}
