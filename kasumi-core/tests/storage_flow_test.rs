use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kasumi_core::{
    Command, CommandKind, Config, Epoch, MemoryBackend, Reply, StorageContext, Worker, wire,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn local_config() -> Config {
    let mut config = Config::default();
    config.bind = "127.0.0.1:0".to_string();
    config
}

async fn spawn_worker(
    config: Config,
    backend: Arc<MemoryBackend>,
) -> (Arc<StorageContext>, SocketAddr, watch::Sender<bool>) {
    let worker = Worker::start(&config, backend, 0, None)
        .await
        .expect("worker should start");
    let ctx = Arc::clone(&worker.ctx);
    let addr = worker
        .server
        .as_ref()
        .expect("worker should serve udp")
        .local_addr()
        .expect("server should have an address");
    let (tx, rx) = watch::channel(false);
    tokio::spawn(worker.run(rx));
    (ctx, addr, tx)
}

fn check_command(digest: [u8; 64], tag: u32) -> Command {
    Command {
        version: 4,
        cmd: CommandKind::Check,
        shingles_count: 0,
        flag: 0,
        tag,
        digest,
        shingle: None,
        extensions: Vec::new(),
    }
}

async fn exchange(server: SocketAddr, datagram: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket.send_to(datagram, server).await.expect("send");

    let mut buf = [0u8; 2048];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("reply should arrive in time")
        .expect("recv");
    buf[..len].to_vec()
}

#[tokio::test]
async fn plaintext_check_hit() {
    let backend = Arc::new(MemoryBackend::new());
    let stored_ts = unix_now_secs() - 10;
    backend.insert_hash([0x01; 64], 7, stored_ts);

    let (ctx, addr, _shutdown) = spawn_worker(local_config(), Arc::clone(&backend)).await;

    let wire_bytes = wire::encode_command(&check_command([0x01; 64], 42));
    let raw = exchange(addr, &wire_bytes).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert_eq!(reply.tag, 42);
    assert_eq!(reply.value, 0);
    assert!(reply.prob >= 0.9);
    assert_eq!(reply.flag, 7);
    assert_eq!(reply.ts, stored_ts);

    let stats = ctx.stats.lock().unwrap();
    assert_eq!(stats.checked[Epoch::Epoch11.index()], 1);
    assert_eq!(stats.found[Epoch::Epoch11.index()], 1);
}

#[tokio::test]
async fn plaintext_check_miss() {
    let backend = Arc::new(MemoryBackend::new());
    let (ctx, addr, _shutdown) = spawn_worker(local_config(), backend).await;

    let wire_bytes = wire::encode_command(&check_command([0x02; 64], 7));
    let raw = exchange(addr, &wire_bytes).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert_eq!(reply.tag, 7);
    assert_eq!(reply.value, 0);
    assert_eq!(reply.prob, 0.0);
    assert_eq!(reply.flag, 0);

    let stats = ctx.stats.lock().unwrap();
    assert_eq!(stats.checked[Epoch::Epoch11.index()], 1);
    assert_eq!(stats.found[Epoch::Epoch11.index()], 0);
}

#[tokio::test]
async fn stat_command_reports_stored_count() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x03; 64], 1, unix_now_secs());
    backend.insert_hash([0x04; 64], 1, unix_now_secs());

    let (_ctx, addr, _shutdown) = spawn_worker(local_config(), backend).await;

    let mut cmd = check_command([0; 64], 9);
    cmd.cmd = CommandKind::Stat;
    let raw = exchange(addr, &wire::encode_command(&cmd)).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert_eq!(reply.value, 0);
    assert_eq!(reply.prob, 1.0);
    assert_eq!(reply.flag, 2);
}

#[tokio::test]
async fn shingle_check_counts_shingle_epoch_stats() {
    let backend = Arc::new(MemoryBackend::new());
    let (ctx, addr, _shutdown) = spawn_worker(local_config(), backend).await;

    let mut cmd = check_command([0x05; 64], 1);
    cmd.shingles_count = wire::SHINGLE_HASHES as u8;
    cmd.shingle = Some(wire::ShingleBlock {
        alg: 1,
        seed: 99,
        hashes: [7; wire::SHINGLE_HASHES],
    });

    let raw = exchange(addr, &wire::encode_command(&cmd)).await;
    Reply::parse(&raw).expect("reply should parse");

    let stats = ctx.stats.lock().unwrap();
    assert_eq!(stats.shingles_checked[Epoch::Epoch11.index()], 1);
}

#[tokio::test]
async fn invalid_datagram_counts_once_and_sends_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let (ctx, addr, _shutdown) = spawn_worker(local_config(), backend).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket.send_to(&[0u8; 10], addr).await.expect("send");

    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "garbage must not be answered");

    // The drop was counted exactly once.
    for _ in 0..50 {
        if ctx.stats.lock().unwrap().invalid_requests == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.stats.lock().unwrap().invalid_requests, 1);
}

#[tokio::test]
async fn encrypted_only_rejects_plaintext() {
    let mut config = local_config();
    config.encrypted_only = true;
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x06; 64], 1, unix_now_secs());

    let (_ctx, addr, _shutdown) = spawn_worker(config, backend).await;

    let raw = exchange(addr, &wire::encode_command(&check_command([0x06; 64], 3))).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert_eq!(reply.value, 403);
    assert_eq!(reply.prob, 0.0);
}

#[tokio::test]
async fn blocked_source_is_dropped_silently() {
    let mut config = local_config();
    config.blocked = vec!["127.0.0.1".to_string()];
    let backend = Arc::new(MemoryBackend::new());

    let (ctx, addr, _shutdown) = spawn_worker(config, backend).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket
        .send_to(&wire::encode_command(&check_command([0x07; 64], 1)), addr)
        .await
        .expect("send");

    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "blocked sources must get no reply");
    // Not an invalid request either; the datagram is simply ignored.
    assert_eq!(ctx.stats.lock().unwrap().invalid_requests, 0);
}
