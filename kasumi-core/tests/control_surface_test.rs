use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kasumi_core::{
    BackendFactory, CONTROL_RELOAD, CONTROL_STAT, CONTROL_SYNC, Command, CommandKind, Config,
    FuzzyBackend, KeypairConfig, MemoryBackend, StorageContext, Worker, control_request,
    read_stat_document, spawn_control,
};
use tokio::sync::watch;

const SECRET_HEX: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

fn socket_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "kasumi-{label}-{}-{}.sock",
        std::process::id(),
        rand_suffix()
    ))
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
}

fn local_config() -> Config {
    let mut config = Config::default();
    config.bind = "127.0.0.1:0".to_string();
    config.allow_update = vec!["127.0.0.1".to_string()];
    config.keypair.push(KeypairConfig {
        secret: SECRET_HEX.to_string(),
        forbidden_ids: vec![],
    });
    config
}

async fn spawn_worker(
    config: Config,
    backend: Arc<MemoryBackend>,
) -> (Arc<StorageContext>, watch::Sender<bool>) {
    let worker = Worker::start(&config, backend, 0, None)
        .await
        .expect("worker should start");
    let ctx = Arc::clone(&worker.ctx);
    let (tx, rx) = watch::channel(false);
    tokio::spawn(worker.run(rx));
    (ctx, tx)
}

fn memory_factory(counter: Arc<AtomicUsize>) -> BackendFactory {
    Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryBackend::new()) as Arc<dyn FuzzyBackend>)
    })
}

async fn request(path: PathBuf, cmd: u8) -> (u8, Option<std::fs::File>) {
    tokio::task::spawn_blocking(move || control_request(&path, cmd).expect("control request"))
        .await
        .expect("blocking task")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_command_drains_pending() {
    let backend = Arc::new(MemoryBackend::new());
    let (ctx, _shutdown) = spawn_worker(local_config(), Arc::clone(&backend)).await;

    let path = socket_path("sync");
    let _task = spawn_control(
        Arc::clone(&ctx),
        path.clone(),
        memory_factory(Arc::new(AtomicUsize::new(0))),
    )
    .expect("control socket should bind");

    ctx.updates.enqueue(Command {
        version: 4,
        cmd: CommandKind::Write,
        shingles_count: 0,
        flag: 1,
        tag: 0,
        digest: [0x61; 64],
        shingle: None,
        extensions: Vec::new(),
    });
    assert_eq!(ctx.queue.as_ref().unwrap().pending_len(), 1);

    let (status, file) = request(path.clone(), CONTROL_SYNC).await;
    assert_eq!(status, 0);
    assert!(file.is_none());
    assert_eq!(ctx.queue.as_ref().unwrap().pending_len(), 0);
    assert_eq!(backend.stored_count(), 1);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stat_command_returns_document_fd() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x62; 64], 1, 1000);
    let (ctx, _shutdown) = spawn_worker(local_config(), backend).await;
    ctx.stats.lock().unwrap().hashes_stored = 1;
    ctx.record_invalid("192.0.2.8".parse::<std::net::IpAddr>().ok());

    let path = socket_path("stat");
    let _task = spawn_control(
        Arc::clone(&ctx),
        path.clone(),
        memory_factory(Arc::new(AtomicUsize::new(0))),
    )
    .expect("control socket should bind");

    let (status, file) = request(path.clone(), CONTROL_STAT).await;
    assert_eq!(status, 0);
    let mut file = file.expect("stat reply must carry a descriptor");

    let doc = read_stat_document(&mut file).expect("stat document should parse");
    assert_eq!(doc["fuzzy_stored"], 1);
    assert_eq!(doc["invalid_requests"], 1);
    assert!(doc["fuzzy_checked"].is_array());
    assert!(doc["fuzzy_shingles"].is_array());
    assert!(doc["fuzzy_found"].is_array());
    assert!(doc["errors_ips"]["192.0.2.8"].is_number());
    // One configured key, listed with its public key and counters.
    let keys = doc["keys"].as_object().expect("keys object");
    assert_eq!(keys.len(), 1);
    let entry = keys.values().next().unwrap();
    assert!(entry["keypair"]["pubkey"].is_string());
    assert_eq!(entry["checked"], 0);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_swaps_the_backend() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_hash([0x63; 64], 1, 1000);
    let (ctx, _shutdown) = spawn_worker(local_config(), backend).await;

    let reopens = Arc::new(AtomicUsize::new(0));
    let path = socket_path("reload");
    let _task = spawn_control(
        Arc::clone(&ctx),
        path.clone(),
        memory_factory(Arc::clone(&reopens)),
    )
    .expect("control socket should bind");

    let (status, _) = request(path.clone(), CONTROL_RELOAD).await;
    assert_eq!(status, 0);
    assert_eq!(reopens.load(Ordering::SeqCst), 1);
    // The fresh backend starts empty and the stored count follows it.
    assert_eq!(ctx.backend().count().await.unwrap(), 0);
    assert_eq!(ctx.stats.lock().unwrap().hashes_stored, 0);

    let _ = std::fs::remove_file(&path);
}
