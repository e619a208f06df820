// A TFTP (RFC 1350) engine for moving firmware images and scripts to and from controllers.
//
// Transfer begins with a request to read or write a file. The file is then sent in blocks of
// 512 bytes, each of which must be acknowledged before the next one is sent. A block shorter
// than 512 bytes ends the transfer, so a file whose size is a multiple of 512 ends with an empty
// block. Block numbers are 16 bits wide and wrap around on long transfers.
//
// Whoever is waiting for a reply retransmits its last packet on timeout, which is how lost
// packets in either direction are recovered. Most errors end the transfer, signalled by an
// ERROR packet that is never acknowledged or retransmitted.
//
// Each transfer runs on its own UDP port (its transfer identifier). The requester sends to
// the server's well-known port and the server answers from a fresh one.
//
// Modules, leaves first:
// - tftp: packet encoding and decoding
// - netascii: line-ending conversion for netascii transfers
// - socket: UDP transport with receive timeouts
// - processor: per-direction transfer state (what to send next, when it's over)
// - session: the shared send/wait/retransmit loop
// - client, srv_conn, server: the two ends that start sessions

pub mod client;
pub mod config;
pub mod error;
pub mod netascii;
pub mod processor;
pub mod server;
pub mod session;
pub mod socket;
pub mod srv_conn;
pub mod tftp;

pub use client::Client;
pub use config::{ServerConfig, ServerMode, TransferConfig};
pub use error::TransferError;
pub use netascii::LineEnding;
pub use processor::TransferStats;
pub use server::{Server, ServerError};
pub use tftp::{ErrorCode, FileMode, Packet};
