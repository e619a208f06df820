// Client side of a transfer: one request to a fixed server, then a session against whichever
// port the server answers from.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::processor::{PacketProcessor, TransferStats};
use crate::session::Session;
use crate::socket::TftpSocket;
use crate::tftp::{self, FileMode};
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;

pub struct Client {
    server: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(server: SocketAddr) -> Client {
        Client::with_config(server, TransferConfig::default())
    }

    pub fn with_config(server: SocketAddr, config: TransferConfig) -> Client {
        Client { server, config }
    }

    /// Sends `local` to the server, where it is stored as `remote`.
    pub async fn upload(&self, mode: FileMode, local: &Path, remote: &str) -> Result<TransferStats, TransferError> {
        check_remote_name(remote)?;
        let f = File::open(local).await?;
        let processor = PacketProcessor::reading(f, mode, self.config.line_ending);

        log::info!("Uploading {:?} to {} as '{}' ({})", local, self.server, remote, mode);
        let request = tftp::Packet::WriteReq { path: remote.to_string(), mode };
        let stats = self.session(processor)?.run(request).await?;
        log::info!("Uploaded {} bytes to {}", stats.bytes, self.server);
        Ok(stats)
    }

    /// Fetches `remote` from the server into `local`.
    ///
    /// `local` only appears once the whole file has arrived. A failed or cancelled download
    /// leaves an existing `local` untouched and creates nothing.
    pub async fn download(&self, mode: FileMode, remote: &str, local: &Path) -> Result<TransferStats, TransferError> {
        check_remote_name(remote)?;
        let partial = PartialFile::for_destination(local);
        let f = File::create(partial.path()).await?;
        let processor = PacketProcessor::writing(f, mode, self.config.line_ending);

        log::info!("Downloading '{}' from {} to {:?} ({})", remote, self.server, local, mode);
        let request = tftp::Packet::ReadReq { path: remote.to_string(), mode };
        let stats = self.session(processor)?.run(request).await?;

        partial.commit(local).await?;
        log::info!("Downloaded {} bytes from {}", stats.bytes, self.server);
        Ok(stats)
    }

    fn session(&self, processor: PacketProcessor) -> Result<Session, TransferError> {
        let sock = TftpSocket::bind_ephemeral_for(self.server)?;
        Ok(Session::to_server(sock, self.server, processor, self.config.clone()))
    }
}

fn check_remote_name(remote: &str) -> Result<(), TransferError> {
    if remote.is_empty() || remote.contains('\0') {
        return Err(TransferError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' can't be sent as a file name", remote.escape_debug()),
        )));
    }
    Ok(())
}

/// A hidden sibling of a download's destination that receives the data, and is removed on drop
/// unless it was renamed into place.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn for_destination(local: &Path) -> PartialFile {
        let name = local.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let tag: u32 = rand::thread_rng().gen();
        PartialFile {
            path: local.with_file_name(format!(".{name}.{tag:08x}.part")),
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(mut self, local: &Path) -> Result<(), io::Error> {
        tokio::fs::rename(&self.path, local).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Couldn't remove partial download {:?}: {}", self.path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_partial_file_is_hidden_sibling() {
        let partial = PartialFile::for_destination(Path::new("/tmp/out/fw.bin"));
        let path = partial.path().to_path_buf();
        assert_eq!(path.parent(), Some(Path::new("/tmp/out")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".fw.bin.") && name.ends_with(".part"));
    }

    #[tokio::test]
    async fn test_partial_file_removed_unless_committed() {
        let tmpdir = TempDir::new("client").unwrap();
        let dest = tmpdir.path().join("fw.bin");

        let partial = PartialFile::for_destination(&dest);
        let partial_path = partial.path().to_path_buf();
        tokio::fs::write(&partial_path, b"half").await.unwrap();
        drop(partial);
        assert!(!partial_path.exists());
        assert!(!dest.exists());

        let partial = PartialFile::for_destination(&dest);
        let partial_path = partial.path().to_path_buf();
        tokio::fs::write(&partial_path, b"whole").await.unwrap();
        partial.commit(&dest).await.unwrap();
        assert!(!partial_path.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"whole".to_vec());
    }

    #[tokio::test]
    async fn test_rejects_unsendable_remote_name() {
        let client = Client::new(([127, 0, 0, 1], 69).into());
        let res = client.upload(FileMode::Octet, Path::new("Cargo.toml"), "bad\0name").await;
        assert!(matches!(res, Err(TransferError::Io(e)) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_upload_missing_local_file_sends_nothing() {
        let tmpdir = TempDir::new("client").unwrap();
        let server = TftpSocket::bind(([127, 0, 0, 1], 0).into()).unwrap();
        let client = Client::new(server.local_addr().unwrap());

        let res = client.upload(FileMode::Octet, &tmpdir.path().join("nope.bin"), "fw.bin").await;
        assert!(matches!(res, Err(TransferError::Io(e)) if e.kind() == io::ErrorKind::NotFound));
        assert!(server.recv_with_timeout(std::time::Duration::from_millis(50)).await.is_err());
    }
}
