// Configuration for transfers and for the server.
//
// Server options:
// - Which requests are served (reads, writes or both)
// - Bind address
// - Filesystem root
// - Per-attempt timeout and retry budget
// - Acceptable port range for per-transfer sockets
// - Max concurrent transfers
// - Whether an upload may replace an existing file

use crate::netascii::LineEnding;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 69;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Knobs shared by every transfer session, on either side.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How long to wait for each reply before retransmitting.
    pub timeout: Duration,

    /// Retransmissions allowed before the session gives up.
    pub max_retries: u32,

    /// How long the receiving side keeps listening after its final ACK, in case the ACK was
    /// lost and the last DATA block is sent again.
    pub linger: Duration,

    /// Local line ending used by NETASCII transfers.
    pub line_ending: LineEnding,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            linger: DEFAULT_TIMEOUT,
            line_ending: LineEnding::native(),
        }
    }
}

/// Which requests a server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    GetOnly,
    PutOnly,
    GetAndPut,
}

impl ServerMode {
    pub fn allows_read(self) -> bool {
        matches!(self, ServerMode::GetOnly | ServerMode::GetAndPut)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, ServerMode::PutOnly | ServerMode::GetAndPut)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,

    /// Every requested file name is resolved inside this directory.
    pub root: PathBuf,

    pub mode: ServerMode,

    pub transfer: TransferConfig,

    /// Local ports to pick per-transfer sockets from. `None` lets the OS choose.
    pub port_range: Option<RangeInclusive<u16>>,

    /// Cap on concurrently running transfers. `None` means no cap.
    pub max_sessions: Option<usize>,

    /// When false, an upload to a name that already exists is refused.
    pub allow_overwrite: bool,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, root: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            bind,
            root: root.into(),
            mode: ServerMode::GetAndPut,
            transfer: TransferConfig::default(),
            port_range: None,
            max_sessions: None,
            allow_overwrite: true,
        }
    }
}
