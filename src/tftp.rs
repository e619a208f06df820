// Wire format for the five RFC 1350 packet types.
//
// Every packet starts with a big-endian 16-bit opcode:
//
// 1  RRQ    | 0x0001 | filename | 0x00 | mode | 0x00 |
// 2  WRQ    | 0x0002 | filename | 0x00 | mode | 0x00 |
// 3  DATA   | 0x0003 | block (u16) | 0..=512 bytes |
// 4  ACK    | 0x0004 | block (u16) |
// 5  ERROR  | 0x0005 | code (u16) | message | 0x00 |
//
// Decoding only checks structure. Whether a well-formed packet makes sense for the state a
// transfer is in is decided by the packet processors.

use std::error;
use std::fmt;
use std::io;

/// Number of payload bytes in every DATA block except the last one of a transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Largest well-formed DATA packet: opcode, block number and a full block.
pub const MAX_PACKET_SIZE: usize = DATA_BUFFER_SIZE + 4;

/// A datagram that could not be decoded as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPacket(pub String);

impl error::Error for MalformedPacket {}

impl fmt::Display for MalformedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed packet: {}", self.0)
    }
}

type CodecResult<T> = Result<T, MalformedPacket>;

fn malformed<T>(reason: impl Into<String>) -> CodecResult<T> {
    Err(MalformedPacket(reason.into()))
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    /// The mode string as it is written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }

    /// Mode strings are matched without regard to case.
    pub fn parse(raw: &str) -> Option<FileMode> {
        match raw.to_ascii_lowercase().as_str() {
            "netascii" => Some(FileMode::NetAscii),
            "octet" => Some(FileMode::Octet),
            _ => None,
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<u16> for ErrorCode {
    /// Codes outside the RFC 1350 table are reported as `Undefined`.
    fn from(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded | io::ErrorKind::WriteZero => {
                ErrorCode::DiskFull
            }
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq { path: String, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet. Wraps modulo 65536.
        block: u16,

        /// The contents of the data itself. Shorter than a full block only at end of file.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

/// The TFTP opcode found in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until a 0
/// byte.
///
/// Returns the raw string bytes and the offset just past the terminator, or `None` if the
/// buffer holds no terminator.
fn terminated_field(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((&buf[..end], end + 1))
}

fn retrieve_op_code(buf: &[u8]) -> CodecResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => malformed(format!("unknown opcode {rawcode}")),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> CodecResult<(String, FileMode)> {
    let Some((raw_path, path_end)) = terminated_field(buf) else {
        return malformed("file name is not terminated with a null byte");
    };
    if raw_path.is_empty() {
        return malformed("file name is empty");
    }
    let Ok(path) = String::from_utf8(raw_path.to_vec()) else {
        return malformed("file name is not valid UTF-8");
    };

    // Anything after the mode terminator is an RFC 2347 option list, which we don't negotiate.
    let Some((raw_mode, _)) = terminated_field(&buf[path_end..]) else {
        return malformed("mode is missing or not terminated with a null byte");
    };

    let raw_mode = String::from_utf8_lossy(raw_mode);
    match FileMode::parse(&raw_mode) {
        Some(mode) => Ok((path, mode)),
        None => malformed(format!("unknown file mode '{raw_mode}'")),
    }
}

fn parse_data(buf: &[u8]) -> CodecResult<Packet> {
    let data = &buf[4..];
    if data.len() > DATA_BUFFER_SIZE {
        return malformed(format!(
            "data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            data.len()
        ));
    }
    Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data: data.to_vec() })
}

fn parse_ack(buf: &[u8]) -> CodecResult<Packet> {
    if buf.len() != 4 {
        return malformed(format!("ack packet must be 4 bytes, got {}", buf.len()));
    }
    Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
}

fn parse_error(buf: &[u8]) -> CodecResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let Some((raw_message, _)) = terminated_field(&buf[4..]) else {
        return malformed("error message is not terminated with a null byte");
    };
    let message = String::from_utf8_lossy(raw_message).into_owned();
    Ok(Packet::Error { code, message })
}

fn push_terminated(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

impl Packet {
    /// Decodes one UDP payload.
    pub fn parse_from_buf(buf: &[u8]) -> CodecResult<Packet> {
        if buf.len() < 4 {
            return malformed(format!("packet of {} bytes is too short", buf.len()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet into its UDP payload. Mode strings are always written in lowercase.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&(self.op_code() as u16).to_be_bytes());
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                push_terminated(&mut buf, path);
                push_terminated(&mut buf, mode.as_str());
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                push_terminated(&mut buf, message);
            }
        }
        buf
    }
}
