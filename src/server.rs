// The listening side of the server.
//
// One task owns the well-known socket and does nothing but receive requests. Every accepted
// RRQ/WRQ is handed to its own task, which binds its own socket (and so its own transfer
// identifier) and runs the transfer to completion. Transfers share nothing but the read-only
// configuration.

use crate::config::ServerConfig;
use crate::socket::{SocketError, TftpSocket};
use crate::srv_conn::ServerRequestHandler;
use crate::tftp::{self, ErrorCode};
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum ServerError {
    AlreadyStarted,
    NotStarted,
    Bind(SocketError),
    /// The listener went away before it reported being ready.
    Stopped,
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::AlreadyStarted => write!(f, "Server is already running"),
            ServerError::NotStarted => write!(f, "Server was not started"),
            ServerError::Bind(e) => write!(f, "Couldn't bind the server socket: {}", e),
            ServerError::Stopped => write!(f, "Server stopped before it was ready"),
        }
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    ready: Option<oneshot::Receiver<Result<SocketAddr, SocketError>>>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    listener: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config: Arc::new(config),
            ready: None,
            local_addr: None,
            shutdown: None,
            listener: None,
        }
    }

    /// Spawns the listener onto the current tokio runtime.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.listener.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = self.config.clone();

        self.listener = Some(tokio::spawn(async move {
            let bound = TftpSocket::bind(config.bind).and_then(|sock| Ok((sock.local_addr()?, sock)));
            let (addr, sock) = match bound {
                Ok(bound) => bound,
                Err(e) => {
                    log::error!("Couldn't bind {}: {}", config.bind, e);
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            log::info!("TFTP server listening on {} ({:?})", addr, config.mode);
            log::info!("Serving files from: {}", config.root.display());
            let _ = ready_tx.send(Ok(addr));

            accept_loop(sock, config, shutdown_rx).await;
        }));
        self.ready = Some(ready_rx);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Waits until the listening socket is bound and returns its address.
    pub async fn await_ready(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let Some(ready) = self.ready.take() else {
            return Err(ServerError::NotStarted);
        };

        match ready.await {
            Ok(Ok(addr)) => {
                self.local_addr = Some(addr);
                Ok(addr)
            }
            Ok(Err(e)) => {
                self.shutdown = None;
                self.listener = None;
                Err(ServerError::Bind(e))
            }
            Err(_) => Err(ServerError::Stopped),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting requests and cancels every transfer still running.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                log::error!("TFTP listener task failed: {}", e);
            }
        }
        self.ready = None;
        self.local_addr = None;
    }
}

async fn accept_loop(sock: TftpSocket, config: Arc<ServerConfig>, mut shutdown: watch::Receiver<bool>) {
    let mut sessions: HashMap<SocketAddr, JoinHandle<()>> = HashMap::new();
    let mut recv_failures: u32 = 0;

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = sock.recv() => received,
        };

        if !matches!(received, Err(SocketError::IO(_))) {
            recv_failures = 0;
        }

        match received {
            Ok((packet @ (tftp::Packet::ReadReq { .. } | tftp::Packet::WriteReq { .. }), src)) => {
                sessions.retain(|_, session| !session.is_finished());

                // The peer didn't get our first reply yet and asked again.
                if sessions.contains_key(&src) {
                    log::debug!("Ignoring repeated request from {}, its transfer is running", src);
                    continue;
                }

                if let Some(max) = config.max_sessions {
                    if sessions.len() >= max {
                        log::warn!("Refusing request from {}: {} transfers already running", src, max);
                        send_error(&sock, src, ErrorCode::Undefined, "Server busy, try again later").await;
                        continue;
                    }
                }

                log::debug!("Accepted {:?} from {}", packet.op_code(), src);
                sessions.insert(src, tokio::spawn(serve_request(config.clone(), packet, src)));
            }
            Ok((packet, src)) => {
                log::warn!("Got {:?} from {} on the listening port", packet.op_code(), src);
                send_error(&sock, src, ErrorCode::IllegalOperation, "Expected a read or write request").await;
            }
            Err(SocketError::PacketParse(src, e)) => {
                log::warn!("Dropping datagram from {}: {}", src, e);
            }
            Err(e) => {
                recv_failures = recv_failures.saturating_add(1);
                let pause = recv_backoff(recv_failures);
                log::error!("TFTP receive error: {}, pausing for {:?}", e, pause);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    log::info!("TFTP server stopped, cancelling {} transfers", sessions.len());
    for session in sessions.values() {
        session.abort();
    }
    // Aborted tasks drop their files and sockets before their handles resolve.
    for (_, session) in sessions {
        let _ = session.await;
    }
}

/// Pause after the `failures`th receive error in a row: 10ms, doubling up to one second.
fn recv_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << exp).min(Duration::from_secs(1))
}

async fn serve_request(config: Arc<ServerConfig>, request: tftp::Packet, src: SocketAddr) {
    let handler = match ServerRequestHandler::new(&config, &request, src).await {
        Ok(handler) => handler,
        Err(e) => {
            log::warn!("Refused request from {}: {}", src, e);
            return;
        }
    };

    match handler.handle().await {
        Ok(stats) => log::info!(
            "Transfer with {} complete: {} bytes in {} blocks",
            src,
            stats.bytes,
            stats.blocks
        ),
        Err(e) => log::warn!("Transfer with {} failed: {}", src, e),
    }
}

async fn send_error(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message: message.to_string() }, dst).await;
}
