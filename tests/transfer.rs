// End-to-end transfers between a real Server and Client over loopback, plus hand-driven peers
// for the loss and duplication cases.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tempdir::TempDir;
use tftp_engine::socket::TftpSocket;
use tftp_engine::{
    Client, ErrorCode, FileMode, LineEnding, Packet, Server, ServerConfig, ServerMode, TransferConfig, TransferError,
};
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config(line_ending: LineEnding) -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_millis(500),
        max_retries: 5,
        linger: Duration::from_millis(100),
        line_ending,
    }
}

fn loopback() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 0).into()
}

async fn start_server(config: ServerConfig) -> (Server, SocketAddr) {
    let mut server = Server::new(config);
    assert_ok!(server.start());
    let addr = assert_ok!(server.await_ready().await);
    (server, addr)
}

fn server_config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::new(loopback(), root);
    config.transfer = fast_config(LineEnding::Lf);
    config
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn round_trip(client: &Client, local_dir: &Path, name: &str, contents: &[u8]) {
    let src = local_dir.join(format!("{name}.src"));
    let dst = local_dir.join(format!("{name}.dst"));
    assert_ok!(tokio::fs::write(&src, contents).await);

    let up = assert_ok!(client.upload(FileMode::Octet, &src, name).await);
    let down = assert_ok!(client.download(FileMode::Octet, name, &dst).await);

    assert_eq!(up.bytes, contents.len() as u64);
    assert_eq!(down, up);
    assert_eq!(up.blocks, contents.len() as u64 / 512 + 1);
    assert!(assert_ok!(tokio::fs::read(&dst).await) == contents, "{name} came back different");
}

#[tokio::test]
async fn test_octet_round_trip_sizes() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let (mut server, addr) = start_server(server_config(root.path())).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));

    for size in [0, 1, 511, 512, 1024, 512 * 3 + 1] {
        let contents = pattern(size);
        round_trip(&client, local.path(), &format!("fw-{size}.bin"), &contents).await;
        let stored = assert_ok!(tokio::fs::read(root.path().join(format!("fw-{size}.bin"))).await);
        assert_eq!(stored, contents);
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_numbers_wrap_on_large_transfer() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let (mut server, addr) = start_server(server_config(root.path())).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));

    // More than 65535 full blocks, so block numbers pass 65535 -> 0 and keep going.
    let contents = pattern(65536 * 512 + 700);
    round_trip(&client, local.path(), "image.bin", &contents).await;

    server.stop().await;
}

#[tokio::test]
async fn test_netascii_round_trip_between_line_endings() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    // The server keeps text in CRLF form, the client in LF form.
    let mut config = server_config(root.path());
    config.transfer.line_ending = LineEnding::CrLf;
    let (mut server, addr) = start_server(config).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));

    let script = "-- scene script\nlocal lights = {1, 2, 3}\n\n".repeat(40);
    let src = local.path().join("scene.lua");
    let dst = local.path().join("scene.copy.lua");
    assert_ok!(tokio::fs::write(&src, &script).await);

    assert_ok!(client.upload(FileMode::NetAscii, &src, "scene.lua").await);
    let stored = assert_ok!(tokio::fs::read_to_string(root.path().join("scene.lua")).await);
    assert_eq!(stored, script.replace('\n', "\r\n"));

    assert_ok!(client.download(FileMode::NetAscii, "scene.lua", &dst).await);
    assert_eq!(assert_ok!(tokio::fs::read_to_string(&dst).await), script);

    server.stop().await;
}

#[tokio::test]
async fn test_missing_file_reports_not_found() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let (mut server, addr) = start_server(server_config(root.path())).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));

    let dst = local.path().join("missing.bin");
    let err = assert_err!(client.download(FileMode::Octet, "missing.bin", &dst).await);
    assert_eq!(err.peer_code(), Some(ErrorCode::FileNotFound));
    assert!(!dst.exists());
    // No partial download left behind either.
    assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_peer_error_codes_surface_unchanged() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    assert_ok!(tokio::fs::write(root.path().join("locked.bin"), b"v1").await);
    let mut config = server_config(root.path());
    config.mode = ServerMode::GetOnly;
    let (mut server, addr) = start_server(config).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));

    let src = local.path().join("new.bin");
    assert_ok!(tokio::fs::write(&src, b"v2").await);
    let err = assert_err!(client.upload(FileMode::Octet, &src, "locked.bin").await);
    assert_eq!(err.peer_code(), Some(ErrorCode::AccessViolation));
    assert_eq!(assert_ok!(tokio::fs::read(root.path().join("locked.bin")).await), b"v1".to_vec());

    let err = assert_err!(client.download(FileMode::Octet, "../etc/passwd", &local.path().join("p")).await);
    assert_eq!(err.peer_code(), Some(ErrorCode::AccessViolation));

    server.stop().await;

    let mut config = server_config(root.path());
    config.allow_overwrite = false;
    let (mut server, addr) = start_server(config).await;
    let client = Client::with_config(addr, fast_config(LineEnding::Lf));
    let err = assert_err!(client.upload(FileMode::Octet, &src, "locked.bin").await);
    match err {
        TransferError::Peer { code, .. } => assert_eq!(code, ErrorCode::FileAlreadyExists),
        other => panic!("unexpected error {other}"),
    }
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_uploads_stay_separate() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let local = TempDir::new("local").unwrap();
    let (mut server, addr) = start_server(server_config(root.path())).await;

    let first = vec![0xA1; 512 * 40 + 17];
    let second = vec![0xB2; 512 * 33 + 200];
    let first_src = local.path().join("a.bin");
    let second_src = local.path().join("b.bin");
    assert_ok!(tokio::fs::write(&first_src, &first).await);
    assert_ok!(tokio::fs::write(&second_src, &second).await);

    let a = Client::with_config(addr, fast_config(LineEnding::Lf));
    let b = Client::with_config(addr, fast_config(LineEnding::Lf));
    let (ra, rb) = tokio::join!(
        a.upload(FileMode::Octet, &first_src, "controller-a.bin"),
        b.upload(FileMode::Octet, &second_src, "controller-b.bin"),
    );
    assert_ok!(ra);
    assert_ok!(rb);

    assert!(assert_ok!(tokio::fs::read(root.path().join("controller-a.bin")).await) == first);
    assert!(assert_ok!(tokio::fs::read(root.path().join("controller-b.bin")).await) == second);

    server.stop().await;
}

#[tokio::test]
async fn test_server_answers_from_transfer_port() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    assert_ok!(tokio::fs::write(root.path().join("boot.scr"), b"boot").await);
    let (mut server, addr) = start_server(server_config(root.path())).await;

    let peer = assert_ok!(TftpSocket::bind(loopback()));
    let request = Packet::ReadReq { path: "boot.scr".to_string(), mode: FileMode::Octet };
    assert_ok!(peer.send(&request, addr).await);

    let (reply, transfer) = assert_ok!(peer.recv_with_timeout(WAIT).await);
    assert_ne!(transfer, addr);
    assert_eq!(reply, Packet::Data { block: 1, data: b"boot".to_vec() });
    assert_ok!(peer.send(&Packet::Ack { block: 1 }, transfer).await);

    server.stop().await;
}

#[tokio::test]
async fn test_server_ignores_duplicate_ack() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let contents = pattern(512 * 2 + 10);
    assert_ok!(tokio::fs::write(root.path().join("fw.bin"), &contents).await);
    let (mut server, addr) = start_server(server_config(root.path())).await;

    let peer = assert_ok!(TftpSocket::bind(loopback()));
    assert_ok!(peer.send(&Packet::ReadReq { path: "fw.bin".to_string(), mode: FileMode::Octet }, addr).await);
    let (reply, transfer) = assert_ok!(peer.recv_with_timeout(WAIT).await);
    assert!(matches!(reply, Packet::Data { block: 1, .. }));

    assert_ok!(peer.send(&Packet::Ack { block: 1 }, transfer).await);
    assert_ok!(peer.send(&Packet::Ack { block: 1 }, transfer).await);

    let (reply, _) = assert_ok!(peer.recv_with_timeout(WAIT).await);
    assert_eq!(reply, Packet::Data { block: 2, data: contents[512..1024].to_vec() });
    // The second ack must not produce a second block 2 or skip ahead to block 3.
    assert!(peer.recv_with_timeout(Duration::from_millis(200)).await.is_err());

    assert_ok!(peer.send(&Packet::Ack { block: 2 }, transfer).await);
    let (reply, _) = assert_ok!(peer.recv_with_timeout(WAIT).await);
    assert_eq!(reply, Packet::Data { block: 3, data: contents[1024..].to_vec() });
    assert_ok!(peer.send(&Packet::Ack { block: 3 }, transfer).await);

    server.stop().await;
}

#[tokio::test]
async fn test_server_recovers_from_lost_ack() {
    init_logging();
    let root = TempDir::new("root").unwrap();
    let (mut server, addr) = start_server(server_config(root.path())).await;

    let peer = assert_ok!(TftpSocket::bind(loopback()));
    assert_ok!(peer.send(&Packet::WriteReq { path: "up.bin".to_string(), mode: FileMode::Octet }, addr).await);
    let (reply, transfer) = assert_ok!(peer.recv_with_timeout(WAIT).await);
    assert_eq!(reply, Packet::Ack { block: 0 });

    let first = Packet::Data { block: 1, data: vec![0x31; 512] };
    assert_ok!(peer.send(&first, transfer).await);
    assert_eq!(assert_ok!(peer.recv_with_timeout(WAIT).await).0, Packet::Ack { block: 1 });

    // Act as if that ack was lost and send block 1 again.
    assert_ok!(peer.send(&first, transfer).await);
    assert_eq!(assert_ok!(peer.recv_with_timeout(WAIT).await).0, Packet::Ack { block: 1 });

    assert_ok!(peer.send(&Packet::Data { block: 2, data: vec![0x32; 5] }, transfer).await);
    assert_eq!(assert_ok!(peer.recv_with_timeout(WAIT).await).0, Packet::Ack { block: 2 });

    // Let the session finish lingering before looking at the file.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut expected = vec![0x31; 512];
    expected.extend_from_slice(&[0x32; 5]);
    assert_eq!(assert_ok!(tokio::fs::read(root.path().join("up.bin")).await), expected);

    server.stop().await;
}

#[tokio::test]
async fn test_cancelled_download_leaves_nothing() {
    init_logging();
    let local = TempDir::new("local").unwrap();
    // A server that sends one full block and then goes quiet.
    let fake = assert_ok!(TftpSocket::bind(loopback()));
    let client = Client::with_config(assert_ok!(fake.local_addr()), fast_config(LineEnding::Lf));
    let dst = local.path().join("fw.bin");

    let download = client.download(FileMode::Octet, "fw.bin", &dst);
    let serve = async {
        let (_, client_addr) = assert_ok!(fake.recv_with_timeout(WAIT).await);
        assert_ok!(fake.send(&Packet::Data { block: 1, data: vec![0; 512] }, client_addr).await);
        tokio::time::sleep(Duration::from_secs(10)).await;
    };

    tokio::select! {
        _ = download => panic!("download should not finish"),
        _ = serve => panic!("fake server should outlast the timeout"),
        _ = tokio::time::sleep(Duration::from_millis(300)) => {}
    }

    assert!(!dst.exists());
    assert_eq!(std::fs::read_dir(local.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_download_times_out_without_server() {
    init_logging();
    let local = TempDir::new("local").unwrap();
    let silent = assert_ok!(TftpSocket::bind(loopback()));
    let config = TransferConfig { timeout: Duration::from_millis(50), max_retries: 2, ..fast_config(LineEnding::Lf) };
    let client = Client::with_config(assert_ok!(silent.local_addr()), config);

    let err = assert_err!(client.download(FileMode::Octet, "fw.bin", &local.path().join("fw.bin")).await);
    assert!(matches!(err, TransferError::Timeout { attempts: 3 }));
    assert_eq!(err.peer_code(), None);
}
