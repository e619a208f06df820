// Per-direction packet processors.
//
// A processor owns the file and block counter of one transfer and decides, for every packet the
// peer sends, what the session loop should do next. It never touches the network itself, which
// keeps the retransmit and timeout handling in one place (see `session`) and lets both
// directions be tested by feeding packets in directly.
//
// ReadProcessor reads a local file and produces DATA blocks, consuming ACKs.
// WriteProcessor consumes DATA blocks into a local file, producing ACKs.

use crate::error::TransferError;
use crate::netascii::{Decoder, Encoder, LineEnding};
use crate::tftp::{self, FileMode};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Totals for one transfer, counted in bytes as they appear on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    pub async fn new_for_reading(
        path: &Path,
        mode: FileMode,
        line_ending: LineEnding,
    ) -> Result<PacketProcessor, io::Error> {
        let f = File::open(path).await?;
        Ok(PacketProcessor::reading(f, mode, line_ending))
    }

    /// Creates or truncates `path`, or refuses an existing file when `overwrite` is false.
    pub async fn new_for_writing(
        path: &Path,
        mode: FileMode,
        line_ending: LineEnding,
        overwrite: bool,
    ) -> Result<PacketProcessor, io::Error> {
        log::debug!("Writing to {:?}", path);
        let f = if overwrite {
            File::create(path).await?
        } else {
            File::create_new(path).await?
        };
        Ok(PacketProcessor::writing(f, mode, line_ending))
    }

    pub fn reading(f: File, mode: FileMode, line_ending: LineEnding) -> PacketProcessor {
        PacketProcessor::Read(ReadProcessor::new(f, mode, line_ending))
    }

    pub fn writing(f: File, mode: FileMode, line_ending: LineEnding) -> PacketProcessor {
        PacketProcessor::Write(WriteProcessor::new(f, mode, line_ending))
    }

    /// The packet that opens a transfer on the serving side: DATA block 1 for a read, ACK 0 for
    /// a write.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(&tftp::Packet::Ack { block: 0 }).await,
            PacketProcessor::Write(_) => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    pub fn stats(&self) -> TransferStats {
        match self {
            PacketProcessor::Read(p) => p.stats,
            PacketProcessor::Write(p) => p.stats,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response, retransmitting it on timeout.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should ignore the packet and keep waiting.
    RetryRecv,

    /// The transfer is done. The caller sends the packet, if any, without expecting a reply.
    Complete(Option<tftp::Packet>),

    /// The transfer failed. The caller tells the peer when the failure is on this side.
    Abort(TransferError),
}

fn peer_error(code: tftp::ErrorCode, message: &str) -> ResultAction {
    ResultAction::Abort(TransferError::Peer { code, message: message.to_string() })
}

/// The sending side of a transfer.
#[derive(Debug)]
pub struct ReadProcessor {
    f: File,
    encoder: Option<Encoder>,
    // Encoded bytes that did not fit into the previous block.
    carry: Vec<u8>,
    eof: bool,
    curr_block: u16,
    awaiting_final_ack: bool,
    stats: TransferStats,
}

impl ReadProcessor {
    fn new(f: File, mode: FileMode, line_ending: LineEnding) -> ReadProcessor {
        ReadProcessor {
            f,
            encoder: match mode {
                FileMode::NetAscii => Some(Encoder::new(line_ending)),
                FileMode::Octet => None,
            },
            carry: Vec::new(),
            eof: false,
            curr_block: 0,
            awaiting_final_ack: false,
            stats: TransferStats::default(),
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                if self.awaiting_final_ack {
                    return ResultAction::Complete(None);
                }
                match self.read_block().await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        if data.len() < tftp::DATA_BUFFER_SIZE {
                            self.awaiting_final_ack = true;
                        }
                        self.stats.blocks += 1;
                        self.stats.bytes += data.len() as u64;
                        ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data })
                    }
                    Err(e) => ResultAction::Abort(TransferError::Io(e)),
                }
            }
            &tftp::Packet::Ack { block } => {
                // Duplicated or delayed acks for blocks other than the one in flight.
                log::debug!("Ignoring ack for block {block} while waiting on block {}", self.curr_block);
                ResultAction::RetryRecv
            }
            tftp::Packet::Error { code, message } => peer_error(*code, message),
            _ => ResultAction::Abort(TransferError::ProtocolViolation(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }

    /// Produces the next block: a full one, or a short one once the file is exhausted.
    async fn read_block(&mut self) -> Result<Vec<u8>, io::Error> {
        let mut block = Vec::with_capacity(tftp::DATA_BUFFER_SIZE);
        let carried = self.carry.len().min(tftp::DATA_BUFFER_SIZE);
        block.extend(self.carry.drain(..carried));

        // A single read is not guaranteed to fill the block, so keep reading into the remaining
        // space until it is full or the file ends.
        let mut raw = vec![0_u8; tftp::DATA_BUFFER_SIZE];
        while block.len() < tftp::DATA_BUFFER_SIZE && !self.eof {
            let want = tftp::DATA_BUFFER_SIZE - block.len();
            let n = self.f.read(&mut raw[..want]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }

            match &self.encoder {
                None => block.extend_from_slice(&raw[..n]),
                Some(encoder) => {
                    let mut encoded = Vec::with_capacity(n * 2);
                    encoder.encode(&raw[..n], &mut encoded);
                    let fits = encoded.len().min(tftp::DATA_BUFFER_SIZE - block.len());
                    block.extend_from_slice(&encoded[..fits]);
                    self.carry.extend_from_slice(&encoded[fits..]);
                }
            }
        }

        Ok(block)
    }
}

/// The receiving side of a transfer.
#[derive(Debug)]
pub struct WriteProcessor {
    f: File,
    decoder: Option<Decoder>,
    curr_block: u16,
    done: bool,
    stats: TransferStats,
}

impl WriteProcessor {
    fn new(f: File, mode: FileMode, line_ending: LineEnding) -> WriteProcessor {
        WriteProcessor {
            f,
            decoder: match mode {
                FileMode::NetAscii => Some(Decoder::new(line_ending)),
                FileMode::Octet => None,
            },
            curr_block: 0,
            done: false,
            stats: TransferStats::default(),
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if !self.done && *block == self.curr_block.wrapping_add(1) => {
                if let Err(e) = self.write_block(data).await {
                    return ResultAction::Abort(TransferError::Io(e));
                }
                self.curr_block = *block;
                self.stats.blocks += 1;
                self.stats.bytes += data.len() as u64;

                let ack = tftp::Packet::Ack { block: self.curr_block };
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if let Err(e) = self.finish().await {
                        return ResultAction::Abort(TransferError::Io(e));
                    }
                    self.done = true;
                    ResultAction::Complete(Some(ack))
                } else {
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } if *block == self.curr_block && self.stats.blocks > 0 => {
                // Our ack was lost and the peer sent the block again. It is already written.
                log::debug!("Re-acknowledging duplicate data block {block}");
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: self.curr_block })
            }
            tftp::Packet::Data { block, .. } => ResultAction::Abort(TransferError::ProtocolViolation(format!(
                "Data blocks must be received in sequence. Received data for block {block}, \
                but the last block received was {cb}.",
                cb = self.curr_block
            ))),
            tftp::Packet::Error { code, message } => peer_error(*code, message),
            _ => ResultAction::Abort(TransferError::ProtocolViolation(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }

    async fn write_block(&mut self, data: &[u8]) -> Result<(), io::Error> {
        match &mut self.decoder {
            None => self.f.write_all(data).await,
            Some(decoder) => {
                let mut out = Vec::with_capacity(data.len());
                decoder.decode(data, &mut out);
                self.f.write_all(&out).await
            }
        }
    }

    async fn finish(&mut self) -> Result<(), io::Error> {
        if let Some(decoder) = &mut self.decoder {
            let mut out = Vec::new();
            decoder.finish(&mut out);
            self.f.write_all(&out).await?;
        }
        self.f.flush().await
    }
}
