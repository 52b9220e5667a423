use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use uftp::config::ServerConfig;
use uftp::protocol::{AckKind, Verb, UFT_BUFFER_SIZE, UFT_FOUND};
use uftp::wire::{self, Packet};
use uftp::{Client, DeleteStatus, Error, FileStore, RetryPolicy, Server, ShutdownManager};

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownManager,
    task: JoinHandle<uftp::Result<()>>,
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(250), 4)
}

async fn start_server(root: &Path) -> Running {
    let config = ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        root: root.to_path_buf(),
        retry: policy(),
        ..ServerConfig::default()
    };
    let mut server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move { server.listen().await });
    Running {
        addr,
        shutdown,
        task,
    }
}

async fn client(addr: SocketAddr, root: &Path) -> Client {
    Client::connect(addr, FileStore::new(root), policy())
        .await
        .unwrap()
}

fn pattern(len: usize, salt: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + salt) * 7 % 256) as u8).collect()
}

async fn wait_for_file(path: &Path) {
    let mut waited = Duration::ZERO;
    while !path.exists() {
        assert!(waited < Duration::from_secs(2), "{} never appeared", path.display());
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += Duration::from_millis(5);
    }
}

async fn stopped(server: Running) {
    let served = tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop after exit")
        .unwrap();
    assert!(served.is_ok());
}

async fn send_raw(socket: &UdpSocket, packet: &Packet) {
    socket.send(&wire::encode(packet).unwrap()).await.unwrap();
}

async fn recv_raw(socket: &UdpSocket) -> Packet {
    let mut buf = vec![0u8; UFT_BUFFER_SIZE];
    let len = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    wire::decode(&buf[..len]).unwrap()
}

#[tokio::test]
async fn get_downloads_byte_identical_file() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let content = pattern(5000, 0);
    std::fs::write(server_dir.path().join("report.bin"), &content).unwrap();
    let server = start_server(server_dir.path()).await;

    let mut client = client(server.addr, client_dir.path()).await;
    let report = client.get("report.bin").await.unwrap();

    assert_eq!(report.bytes, 5000);
    assert_eq!(report.chunks, 3);
    assert_eq!(std::fs::read(client_dir.path().join("report.bin")).unwrap(), content);
    server.shutdown.send();
}

#[tokio::test]
async fn get_of_missing_file_creates_nothing() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = start_server(server_dir.path()).await;

    let mut client = client(server.addr, client_dir.path()).await;
    let err = client.get("nope").await.unwrap_err();
    assert!(matches!(err, Error::FileNotFound(name) if name == "nope"));
    assert!(!client_dir.path().join("nope").exists());
    server.shutdown.send();
}

#[tokio::test]
async fn put_uploads_byte_identical_file() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let content = pattern(7000, 3);
    std::fs::write(client_dir.path().join("upload.dat"), &content).unwrap();
    let server = start_server(server_dir.path()).await;

    let mut client = client(server.addr, client_dir.path()).await;
    let report = client.put("upload.dat").await.unwrap();
    assert_eq!(report.chunks, 4);

    // the server closes the file once the completion notice is processed
    let uploaded = server_dir.path().join("upload.dat");
    let mut waited = Duration::ZERO;
    while std::fs::read(&uploaded).map(|b| b != content).unwrap_or(true) {
        assert!(waited < Duration::from_secs(2), "upload never landed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    server.shutdown.send();
}

#[tokio::test]
async fn delete_and_list() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    for name in ["c", "a", "b"] {
        std::fs::write(server_dir.path().join(name), name).unwrap();
    }
    let server = start_server(server_dir.path()).await;
    let mut client = client(server.addr, client_dir.path()).await;

    assert_eq!(client.list().await.unwrap(), vec!["a", "b", "c"]);

    assert_eq!(client.delete("zzz").await.unwrap(), DeleteStatus::NotFound);
    assert_eq!(client.list().await.unwrap().len(), 3);

    assert_eq!(client.delete("b").await.unwrap(), DeleteStatus::Deleted);
    assert!(!server_dir.path().join("b").exists());
    assert_eq!(client.list().await.unwrap(), vec!["a", "c"]);
    server.shutdown.send();
}

#[tokio::test]
async fn concurrent_gets_complete_independently() {
    let server_dir = TempDir::new().unwrap();
    let first = pattern(9000, 1);
    let second = pattern(3000, 2);
    std::fs::write(server_dir.path().join("one"), &first).unwrap();
    std::fs::write(server_dir.path().join("two"), &second).unwrap();
    let server = start_server(server_dir.path()).await;

    let dir_one = TempDir::new().unwrap();
    let dir_two = TempDir::new().unwrap();
    let mut client_one = client(server.addr, dir_one.path()).await;
    let mut client_two = client(server.addr, dir_two.path()).await;

    let (a, b) = tokio::join!(client_one.get("one"), client_two.get("two"));
    assert_eq!(a.unwrap().chunks, 5);
    assert_eq!(b.unwrap().chunks, 2);
    assert_eq!(std::fs::read(dir_one.path().join("one")).unwrap(), first);
    assert_eq!(std::fs::read(dir_two.path().join("two")).unwrap(), second);
    server.shutdown.send();
}

#[tokio::test]
async fn sequential_commands_from_one_client() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    std::fs::write(server_dir.path().join("f"), pattern(4096, 5)).unwrap();
    let server = start_server(server_dir.path()).await;
    let mut client = client(server.addr, client_dir.path()).await;

    client.get("f").await.unwrap();
    client.get("f").await.unwrap();
    client.chat("hello from the test").await.unwrap();
    assert_eq!(client.list().await.unwrap(), vec!["f"]);
    server.shutdown.send();
}

#[tokio::test]
async fn exit_stops_the_server() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let server = start_server(server_dir.path()).await;
    let mut client = client(server.addr, client_dir.path()).await;

    client.exit().await.unwrap();
    stopped(server).await;
}

#[tokio::test]
async fn exit_lets_a_running_get_finish() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let content = pattern(400_000, 9);
    std::fs::write(server_dir.path().join("big"), &content).unwrap();
    let server = start_server(server_dir.path()).await;

    let mut getter = client(server.addr, client_dir.path()).await;
    let download = tokio::spawn(async move { getter.get("big").await });
    wait_for_file(&client_dir.path().join("big")).await;

    let mut quitter = client(server.addr, client_dir.path()).await;
    quitter.exit().await.unwrap();

    let report = download.await.unwrap().unwrap();
    assert_eq!(report.bytes, 400_000);
    assert_eq!(std::fs::read(client_dir.path().join("big")).unwrap(), content);
    stopped(server).await;
}

#[tokio::test]
async fn exit_lets_a_running_put_finish() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let content = pattern(400_000, 4);
    std::fs::write(client_dir.path().join("big"), &content).unwrap();
    let server = start_server(server_dir.path()).await;

    let mut putter = client(server.addr, client_dir.path()).await;
    let upload = tokio::spawn(async move { putter.put("big").await });
    wait_for_file(&server_dir.path().join("big")).await;

    let mut quitter = client(server.addr, client_dir.path()).await;
    quitter.exit().await.unwrap();

    assert_eq!(upload.await.unwrap().unwrap().bytes, 400_000);
    stopped(server).await;
    assert_eq!(std::fs::read(server_dir.path().join("big")).unwrap(), content);
}

#[tokio::test]
async fn exit_keeps_an_offered_get_open() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    std::fs::write(server_dir.path().join("f"), b"0123456789").unwrap();
    let server = start_server(server_dir.path()).await;

    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    raw.connect(server.addr).await.unwrap();
    send_raw(&raw, &Packet::command(Verb::Get, "f")).await;
    assert_eq!(recv_raw(&raw).await, Packet::file_size_ack(Some(10)));

    let mut quitter = client(server.addr, client_dir.path()).await;
    quitter.exit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!server.task.is_finished());

    send_raw(&raw, &Packet::ack(AckKind::FileSize, UFT_FOUND, "")).await;
    let chunk = recv_raw(&raw).await;
    assert_eq!(chunk.seq, 0);
    assert_eq!(&chunk.payload[..], b"0123456789");
    send_raw(&raw, &Packet::ack(AckKind::Data, 0, "")).await;
    stopped(server).await;
}
