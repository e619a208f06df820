// The retrying exchange shared by every transfer, in both directions and on both sides.
//
// A session alternates between two phases:
//
// 1. Work: send the current outbound packet (a request, a DATA block or an ACK).
// 2. Wait: receive until the packet processor produces the next outbound packet, finishes,
//    or fails. If nothing useful arrives before the per-attempt deadline, go back to 1 and send
//    the same packet again, up to the configured number of retries.
//
// What to send and when the transfer is over is decided entirely by the processor, so reads
// and writes share the timeout, retransmission and peer-tracking logic here.
//
// The peer's transfer identifier (its UDP port) is fixed once its first packet is seen. A
// client sends its request to the server's well-known port but the server answers from a fresh
// port, which then becomes the only accepted source. Packets from anywhere else are answered
// with an UnknownTransferId error and otherwise ignored.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::processor::{PacketProcessor, ResultAction, TransferStats};
use crate::socket::{SocketError, TftpSocket};
use crate::tftp::{ErrorCode, Packet};
use std::net::SocketAddr;
use tokio::time::Instant;

pub struct Session {
    sock: TftpSocket,

    /// The address to send packets to.
    peer: SocketAddr,

    /// Whether `peer` has been heard from. Until then a reply from another port on the same
    /// host is accepted and adopted.
    peer_confirmed: bool,

    processor: PacketProcessor,

    config: TransferConfig,
}

impl Session {
    /// A session whose peer is already known, as on the serving side of a transfer.
    pub fn new(sock: TftpSocket, peer: SocketAddr, processor: PacketProcessor, config: TransferConfig) -> Session {
        Session { sock, peer, peer_confirmed: true, processor, config }
    }

    /// A session that opens with a request to `server` and learns the server's transfer port from
    /// its first reply.
    pub fn to_server(sock: TftpSocket, server: SocketAddr, processor: PacketProcessor, config: TransferConfig) -> Session {
        Session { sock, peer: server, peer_confirmed: false, processor, config }
    }

    /// Drives the transfer to completion, starting by sending `first`.
    ///
    /// Dropping the returned future cancels the transfer and closes the file and socket.
    pub async fn run(mut self, first: Packet) -> Result<TransferStats, TransferError> {
        let mut out_packet = first;
        let mut retries = 0;

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        'exchange: loop {
            self.sock.send(&out_packet, self.peer).await?;

            let deadline = Instant::now() + self.config.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.sock.recv_with_timeout(remaining).await {
                    Ok((packet, src)) => {
                        if !self.accept_source(src).await {
                            continue;
                        }
                        log::trace!("Got packet from {}: {:?}", src, packet.op_code());

                        match self.processor.process_packet(&packet).await {
                            ResultAction::SendPacketAndAwait(p) => {
                                out_packet = p;
                                retries = 0;
                                continue 'exchange;
                            }
                            ResultAction::RetryRecv => continue,
                            ResultAction::Complete(last) => {
                                if let Some(p) = last {
                                    self.sock.send(&p, self.peer).await?;
                                    self.linger().await;
                                }
                                return Ok(self.processor.stats());
                            }
                            ResultAction::Abort(e) => {
                                self.notify_peer(&e).await;
                                return Err(e);
                            }
                        }
                    }
                    // If we timed out, rebroadcast the last sent packet
                    Err(SocketError::Timeout(_)) => {
                        if retries >= self.config.max_retries {
                            log::warn!("No reply from {} after {} attempts, giving up", self.peer, retries + 1);
                            return Err(TransferError::Timeout { attempts: retries + 1 });
                        }
                        retries += 1;
                        log::debug!("Timed out waiting on {}, retransmitting (retry {})", self.peer, retries);
                        continue 'exchange;
                    }
                    // A corrupt or foreign datagram is not a reason to abandon the transfer.
                    Err(SocketError::PacketParse(src, e)) => {
                        log::warn!("Dropping datagram from {}: {}", src, e);
                        continue;
                    }
                    Err(SocketError::IO(e)) => return Err(e.into()),
                }
            }
        }
    }

    /// Checks a packet's source against the transfer's peer, adopting the source as the peer if
    /// it is the first reply from the expected host.
    async fn accept_source(&mut self, src: SocketAddr) -> bool {
        if src == self.peer {
            self.peer_confirmed = true;
            return true;
        }

        if !self.peer_confirmed && src.ip() == self.peer.ip() {
            log::debug!("{} answered from port {}, continuing the transfer there", self.peer, src.port());
            self.peer = src;
            self.peer_confirmed = true;
            return true;
        }

        log::warn!("Got a packet from {} during a transfer with {}", src, self.peer);
        let reply = Packet::Error {
            code: ErrorCode::UnknownTransferId,
            message: "This port is in use by another transfer".to_string(),
        };
        let _ = self.sock.send(&reply, src).await;
        false
    }

    /// Keeps answering a retransmitted final DATA block for a while after the final ACK, since
    /// the peer only retransmits if that ACK got lost.
    async fn linger(&mut self) {
        let deadline = Instant::now() + self.config.linger;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) if src == self.peer => {
                    if let ResultAction::SendPacketAndAwait(p) = self.processor.process_packet(&packet).await {
                        log::debug!("Final ack to {} was lost, sending it again", self.peer);
                        if self.sock.send(&p, self.peer).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(_) | Err(SocketError::PacketParse(..)) => continue,
                Err(_) => return,
            }
        }
    }

    async fn notify_peer(&self, error: &TransferError) {
        if let Some((code, message)) = error.to_packet_fields() {
            // Error packet is sent as a courtesy, we don't care how it goes.
            let _ = self.sock.send(&Packet::Error { code, message }, self.peer).await;
        }
    }
}
