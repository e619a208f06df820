use crate::socket::SocketError;
use crate::tftp::ErrorCode;
use std::error;
use std::fmt;
use std::io;

/// Why a transfer session ended without completing.
#[derive(Debug)]
pub enum TransferError {
    /// The peer sent a well-formed packet that makes no sense at this point of the transfer.
    ProtocolViolation(String),

    /// The peer ended the transfer with an Error packet.
    Peer { code: ErrorCode, message: String },

    /// Nothing usable arrived from the peer within the retry budget.
    Timeout { attempts: u32 },

    /// A local file or socket operation failed.
    Io(io::Error),
}

impl TransferError {
    /// The error code the peer reported, if the peer is the one who ended the transfer.
    pub fn peer_code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Peer { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The code and message to send the peer when this side gives up, if one should be sent.
    pub(crate) fn to_packet_fields(&self) -> Option<(ErrorCode, String)> {
        match self {
            TransferError::ProtocolViolation(msg) => Some((ErrorCode::IllegalOperation, msg.clone())),
            TransferError::Io(e) => Some((e.kind().into(), e.to_string())),
            _ => None,
        }
    }
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransferError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            TransferError::Peer { code, message } => {
                write!(f, "Peer reported error {:?} ({}): '{}'", code, code.as_u16(), message)
            }
            TransferError::Timeout { attempts } => {
                write!(f, "Transfer timed out after {} attempts", attempts)
            }
            TransferError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> TransferError {
        TransferError::Io(e)
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> TransferError {
        match e {
            SocketError::IO(e) => TransferError::Io(e),
            SocketError::PacketParse(src, e) => {
                TransferError::ProtocolViolation(format!("Undecodable packet from {}: {}", src, e))
            }
            SocketError::Timeout(_) => TransferError::Timeout { attempts: 1 },
        }
    }
}
