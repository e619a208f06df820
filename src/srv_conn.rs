// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance, which works in roughly the following stages:
//
// 1. Bind a fresh socket for the transfer. Everything the peer hears about this request,
//    including a refusal, comes from that socket's port.
// 2. Check whether the request can be serviced: the server mode must allow it and the file name
//    must resolve inside the server root. Then open the file.
// 3. Hand the socket and a packet processor to a Session, which runs the work and wait cycles
//    until the transfer completes or fails.

use crate::config::{ServerConfig, TransferConfig};
use crate::error::TransferError;
use crate::processor::{PacketProcessor, ResultAction, TransferStats};
use crate::session::Session;
use crate::socket::{SocketError, TftpSocket};
use crate::tftp::{self, ErrorCode};
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use tokio::io;

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets for this transfer.
    sock: TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    transfer: TransferConfig,
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

/// Resolves a requested file name against the server root.
///
/// Leading slashes are ignored, so "/fw/boot.bin" and "fw/boot.bin" name the same file. Any
/// name that could leave the root ("..", drive prefixes) is refused.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, ServerConnectionError> {
    let relative = Path::new(requested.trim_start_matches(['/', '\\']));
    let mut resolved = root.to_path_buf();
    let mut depth = 0;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ServerConnectionError::Refused(
                    ErrorCode::AccessViolation,
                    format!("'{requested}' is outside the served directory"),
                ));
            }
        }
    }

    if depth == 0 {
        return Err(ServerConnectionError::Refused(
            ErrorCode::FileNotFound,
            format!("'{requested}' does not name a file"),
        ));
    }

    Ok(resolved)
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        initial_request: &tftp::Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let sock = match &config.port_range {
            Some(range) => TftpSocket::bind_random_for(src, range)?,
            None => TftpSocket::bind_ephemeral_for(src)?,
        };

        match ServerRequestHandler::open_processor(config, initial_request).await {
            Ok(processor) => Ok(ServerRequestHandler { sock, dst: src, processor, transfer: config.transfer.clone() }),
            Err(e) => {
                if let Some((code, message)) = e.reply() {
                    send_error_packet(&sock, src, code, message).await;
                }
                Err(e)
            }
        }
    }

    async fn open_processor(
        config: &ServerConfig,
        request: &tftp::Packet,
    ) -> Result<PacketProcessor, ServerConnectionError> {
        let line_ending = config.transfer.line_ending;
        match request {
            tftp::Packet::ReadReq { path, mode } => {
                if !config.mode.allows_read() {
                    return Err(ServerConnectionError::Refused(
                        ErrorCode::AccessViolation,
                        "This server does not serve reads".to_string(),
                    ));
                }
                let file = resolve_path(&config.root, path)?;
                log::info!("Sending {:?} ({})", file, mode);
                Ok(PacketProcessor::new_for_reading(&file, *mode, line_ending).await?)
            }
            tftp::Packet::WriteReq { path, mode } => {
                if !config.mode.allows_write() {
                    return Err(ServerConnectionError::Refused(
                        ErrorCode::AccessViolation,
                        "This server does not accept writes".to_string(),
                    ));
                }
                let file = resolve_path(&config.root, path)?;
                log::info!("Receiving {:?} ({})", file, mode);
                Ok(PacketProcessor::new_for_writing(&file, *mode, line_ending, config.allow_overwrite).await?)
            }
            _ => Err(ServerConnectionError::BadRequest(
                "Only read and write requests are valid initial requests.".to_string(),
            )),
        }
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(mut self) -> Result<TransferStats, TransferError> {
        let first = match self.processor.first_packet().await {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::Abort(e) => {
                if let Some((code, message)) = e.to_packet_fields() {
                    send_error_packet(&self.sock, self.dst, code, message).await;
                }
                return Err(e);
            }
            ResultAction::Complete(_) | ResultAction::RetryRecv => {
                return Err(TransferError::ProtocolViolation(
                    "Packet processor finished before the first packet was sent".to_string(),
                ));
            }
        };

        Session::new(self.sock, self.dst, self.processor, self.transfer).run(first).await
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    /// The request was understood but will not be served.
    Refused(ErrorCode, String),
    BadRequest(String),
    File(io::Error),
    Socket(SocketError),
}

impl ServerConnectionError {
    /// The error packet contents to send back to the requester.
    fn reply(&self) -> Option<(ErrorCode, String)> {
        match self {
            Self::Refused(code, msg) => Some((*code, msg.clone())),
            Self::BadRequest(msg) => Some((ErrorCode::IllegalOperation, msg.clone())),
            Self::File(e) => Some((e.kind().into(), e.to_string())),
            Self::Socket(_) => None,
        }
    }
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Refused(code, msg) => write!(f, "Refused ({:?}): {}", code, msg),
            Self::BadRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Socket(e) => write!(f, "{}", e),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
