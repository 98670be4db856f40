use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kasumi_core::{
    Command, CommandKind, Config, KeypairConfig, MemoryBackend, Reply, StorageContext, Worker,
    open_reply, seal_command, wire,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;

const SECRET_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn keyed_config(forbidden_ids: Vec<u32>) -> Config {
    let mut config = Config::default();
    config.bind = "127.0.0.1:0".to_string();
    config.keypair.push(KeypairConfig {
        secret: SECRET_HEX.to_string(),
        forbidden_ids,
    });
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
async fn encrypted_check_roundtrip() {
    let backend = Arc::new(MemoryBackend::new());
    let stored_ts = unix_now_secs() - 30;
    backend.insert_hash([0x11; 64], 3, stored_ts);

    let (ctx, addr, _shutdown) = spawn_worker(keyed_config(vec![]), backend).await;
    let server_pk = ctx
        .keys
        .default_key()
        .expect("key should be loaded")
        .keypair()
        .public_bytes();

    let plain = wire::encode_command(&check_command([0x11; 64], 55));
    let (datagram, shared) = seal_command(&server_pk, &plain);

    let raw = exchange(addr, &datagram).await;
    let decrypted = open_reply(&shared, &raw).expect("reply should decrypt");
    let reply = Reply::parse(&decrypted).expect("reply should parse");

    assert_eq!(reply.tag, 55);
    assert_eq!(reply.value, 0);
    assert!(reply.prob >= 0.9);
    assert_eq!(reply.flag, 3);
    assert_eq!(reply.ts, stored_ts);
}

#[tokio::test]
async fn forbidden_flag_blanks_encrypted_reply() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x12; 64], 5, unix_now_secs() - 30);

    // Flag 5 is forbidden for this key.
    let (ctx, addr, _shutdown) = spawn_worker(keyed_config(vec![5]), backend).await;
    let server_pk = ctx
        .keys
        .default_key()
        .expect("key should be loaded")
        .keypair()
        .public_bytes();

    let plain = wire::encode_command(&check_command([0x12; 64], 8));
    let (datagram, shared) = seal_command(&server_pk, &plain);

    let raw = exchange(addr, &datagram).await;
    let decrypted = open_reply(&shared, &raw).expect("reply should decrypt");
    let reply = Reply::parse(&decrypted).expect("reply should parse");

    assert_eq!(reply.value, 0);
    assert_eq!(reply.prob, 0.0);
    assert_eq!(reply.flag, 0);
    assert_eq!(reply.ts, 0);
}

#[tokio::test]
async fn two_encrypted_replies_use_fresh_nonces() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x13; 64], 1, unix_now_secs());

    let (ctx, addr, _shutdown) = spawn_worker(keyed_config(vec![]), backend).await;
    let server_pk = ctx
        .keys
        .default_key()
        .expect("key should be loaded")
        .keypair()
        .public_bytes();

    let plain = wire::encode_command(&check_command([0x13; 64], 1));
    let (datagram, shared) = seal_command(&server_pk, &plain);

    let first = exchange(addr, &datagram).await;
    let second = exchange(addr, &datagram).await;

    assert_ne!(
        &first[..wire::NONCE_LEN],
        &second[..wire::NONCE_LEN],
        "reply nonces must never repeat"
    );
    assert!(open_reply(&shared, &first).is_ok());
    assert!(open_reply(&shared, &second).is_ok());
}

#[tokio::test]
async fn corrupted_encrypted_request_counts_invalid() {
    let backend = Arc::new(MemoryBackend::new());
    let (ctx, addr, _shutdown) = spawn_worker(keyed_config(vec![]), backend).await;
    let server_pk = ctx
        .keys
        .default_key()
        .expect("key should be loaded")
        .keypair()
        .public_bytes();

    let plain = wire::encode_command(&check_command([0x14; 64], 1));
    let (mut datagram, _) = seal_command(&server_pk, &plain);
    let last = datagram.len() - 1;
    datagram[last] ^= 0xff;

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client socket");
    socket.send_to(&datagram, addr).await.expect("send");

    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "undecryptable datagrams get no reply");

    for _ in 0..50 {
        if ctx.stats.lock().unwrap().invalid_requests == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ctx.stats.lock().unwrap().invalid_requests, 1);
}

#[tokio::test]
async fn delayed_hash_is_blanked() {
    let mut config = keyed_config(vec![]);
    config.delay = 600.0;
    let backend = Arc::new(MemoryBackend::new());
    // Stored just now: well inside even the smallest jittered window.
    backend.insert_hash([0x15; 64], 2, unix_now_secs());

    let (ctx, addr, _shutdown) = spawn_worker(config, backend).await;

    let raw = exchange(addr, &wire::encode_command(&check_command([0x15; 64], 4))).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert_eq!(reply.value, 0);
    assert_eq!(reply.prob, 0.0);
    assert_eq!(reply.ts, 0);
    assert_eq!(ctx.stats.lock().unwrap().delayed_hashes, 1);
}

#[tokio::test]
async fn delay_whitelist_bypasses_delay() {
    let mut config = keyed_config(vec![]);
    config.delay = 600.0;
    config.delay_whitelist = vec!["127.0.0.1".to_string()];
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x16; 64], 2, unix_now_secs());

    let (_ctx, addr, _shutdown) = spawn_worker(config, backend).await;

    let raw = exchange(addr, &wire::encode_command(&check_command([0x16; 64], 4))).await;
    let reply = Reply::parse(&raw).expect("reply should parse");

    assert!(reply.prob >= 0.9, "whitelisted sources see fresh hashes");
}
