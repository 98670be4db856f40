use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::FuzzyBackend;
use crate::cache::TtlLru;
use crate::config::Config;
use crate::crypto::{Keypair, SharedSecret, SharedSecretCache};
use crate::hooks::{HookRequest, HookSet};
use crate::keys::{FuzzyKey, KeyRegistry};
use crate::maps::{IpNetMap, StringSetMap};
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::stats::GlobalStats;
use crate::update::{UpdateHandle, UpdateQueue};
use crate::wire::{
    self, Command, CommandKind, ENCRYPTED_HEADER_SIZE, Epoch, EncryptedHeader, ProtocolError,
    Reply,
};

/// Receive buffer per datagram.
pub const INPUT_BUFLEN: usize = 1024;
/// Datagrams drained per readiness wakeup.
pub const RECV_BATCH: usize = 16;
/// Bound on tracked per-source decode-error counters.
pub const ERRORS_IPS_CAPACITY: usize = 1024;

/// Fractional unix seconds; the timestamp domain for buckets and stats.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Shared per-worker state. One instance per process, shared by the receive
/// loop, in-flight sessions, timers and the control surface.
pub struct StorageContext {
    pub sync_timeout: f64,
    pub expire: f64,
    pub delay: f64,
    pub encrypted_only: bool,
    pub read_only: bool,
    pub dedicated_update_worker: bool,
    pub ratelimit_log_only: bool,
    pub worker_index: usize,

    pub keys: KeyRegistry,
    pub update_ips: IpNetMap,
    pub update_keys: StringSetMap,
    pub skip_hashes: StringSetMap,
    pub blocked_ips: IpNetMap,
    pub delay_whitelist: IpNetMap,

    pub stats: Arc<Mutex<GlobalStats>>,
    pub limiter: Option<Mutex<RateLimiter>>,
    pub errors_ips: Mutex<TtlLru<IpAddr, u64>>,
    pub secret_cache: Mutex<SharedSecretCache>,
    pub hooks: HookSet,

    backend: RwLock<Arc<dyn FuzzyBackend>>,
    pub updates: UpdateHandle,
    /// Present on worker 0 only: the queue behind `updates`.
    pub queue: Option<Arc<UpdateQueue>>,
}

impl StorageContext {
    /// Builds the worker context from its configuration. `updates` routes
    /// mutations (worker 0 queue or peer pipe); `queue` is worker 0's own.
    pub fn new(
        config: &Config,
        backend: Arc<dyn FuzzyBackend>,
        worker_index: usize,
        updates: UpdateHandle,
        queue: Option<Arc<UpdateQueue>>,
    ) -> Result<Arc<Self>> {
        let mut keys = KeyRegistry::default();
        for entry in &config.keypair {
            let keypair = Keypair::from_secret_hex(&entry.secret)?;
            let key = keys.insert(FuzzyKey::new(keypair, entry.forbidden_ids.clone()));
            debug!(key = %key.id().short(), "loaded keypair");
        }

        let ratelimit_whitelist = IpNetMap::parse(&config.ratelimit_whitelist)
            .context("bad ratelimit_whitelist entry")?;
        let limiter = RateLimiter::new(
            config.ratelimit_rate,
            config.ratelimit_burst,
            config.ratelimit_network_mask,
            config.ratelimit_max_buckets,
            config.ratelimit_bucket_ttl,
            ratelimit_whitelist,
        )
        .map(Mutex::new);

        Ok(Arc::new(Self {
            sync_timeout: config.sync,
            expire: config.expire,
            delay: config.delay,
            encrypted_only: config.encrypted_only,
            read_only: config.read_only,
            dedicated_update_worker: config.dedicated_update_worker,
            ratelimit_log_only: config.ratelimit_log_only,
            worker_index,
            keys,
            update_ips: IpNetMap::parse(&config.allow_update).context("bad allow_update entry")?,
            update_keys: StringSetMap::from_entries(&config.allow_update_keys),
            skip_hashes: StringSetMap::from_entries(&config.skip_hashes),
            blocked_ips: IpNetMap::parse(&config.blocked).context("bad blocked entry")?,
            delay_whitelist: IpNetMap::parse(&config.delay_whitelist)
                .context("bad delay_whitelist entry")?,
            stats: Arc::new(Mutex::new(GlobalStats::default())),
            limiter,
            errors_ips: Mutex::new(TtlLru::new(ERRORS_IPS_CAPACITY, None)),
            secret_cache: Mutex::new(SharedSecretCache::new(config.keypair_cache_size)),
            hooks: HookSet::default(),
            backend: RwLock::new(backend),
            updates,
            queue,
        }))
    }

    pub fn backend(&self) -> Arc<dyn FuzzyBackend> {
        self.backend.read().unwrap().clone()
    }

    pub fn swap_backend(&self, backend: Arc<dyn FuzzyBackend>) {
        *self.backend.write().unwrap() = backend;
    }

    /// Registers (or replaces) the pre-request hook.
    pub fn add_pre_handler(&self, handler: Arc<crate::hooks::PreHandler>) {
        self.hooks.set_pre_handler(handler);
    }

    /// Registers (or replaces) the post-result hook.
    pub fn add_post_handler(&self, handler: Arc<crate::hooks::PostHandler>) {
        self.hooks.set_post_handler(handler);
    }

    /// Registers (or replaces) the blacklist notification hook.
    pub fn add_blacklist_handler(&self, handler: Arc<crate::hooks::BlacklistHandler>) {
        self.hooks.set_blacklist_handler(handler);
    }

    /// Counts a datagram that produced no reply.
    pub fn record_invalid(&self, addr: Option<IpAddr>) {
        self.stats.lock().unwrap().invalid_requests += 1;
        if let Some(ip) = addr {
            let mut errors = self.errors_ips.lock().unwrap();
            let now = unix_now();
            match errors.get_mut(&ip, now) {
                Some(count) => *count += 1,
                None => errors.put(ip, 1, now),
            }
        }
    }
}

/// One in-flight request. Retained by the processing task across the
/// backend await; the shared secret is wiped when the session drops.
pub struct Session {
    pub addr: Option<SocketAddr>,
    pub timestamp: f64,
    pub cmd: Command,
    pub epoch: Epoch,
    pub encrypted: bool,
    pub key: Option<Arc<FuzzyKey>>,
    nm: Option<SharedSecret>,
}

impl Session {
    fn ip(&self) -> Option<IpAddr> {
        self.addr.map(|addr| addr.ip())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr)
            .field("timestamp", &self.timestamp)
            .field("cmd", &self.cmd)
            .field("epoch", &self.epoch)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// Decodes one datagram into a session, decrypting in place when the
/// encrypted envelope is present.
pub fn decode_session(
    ctx: &StorageContext,
    buf: &mut [u8],
    addr: Option<SocketAddr>,
    timestamp: f64,
) -> Result<Session, ProtocolError> {
    let mut encrypted = false;
    let mut key = None;
    let mut nm = None;
    let mut payload_start = 0usize;

    if wire::is_encrypted(buf) {
        if ctx.keys.is_empty() {
            warn!("received encrypted request when encryption is not enabled");
            return Err(ProtocolError::UnknownKey);
        }
        let header = EncryptedHeader::parse(buf)?;
        let matched = ctx
            .keys
            .lookup_or_default(&header.key_id)
            .ok_or(ProtocolError::UnknownKey)?;

        let shared = ctx
            .secret_cache
            .lock()
            .unwrap()
            .derive(matched.keypair(), &header.ephemeral_pk);

        if crate::crypto::open_in_place(&shared, &header, &mut buf[ENCRYPTED_HEADER_SIZE..])
            .is_err()
        {
            debug!(source = ?addr, "decryption failed");
            return Err(ProtocolError::DecryptFailed);
        }

        encrypted = true;
        key = Some(matched);
        nm = Some(shared);
        payload_start = ENCRYPTED_HEADER_SIZE;
    }

    let (cmd, epoch) = wire::parse_command(&buf[payload_start..])?;

    Ok(Session {
        addr,
        timestamp,
        cmd,
        epoch,
        encrypted,
        key,
        nm,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct ReplyFlags {
    shingle: bool,
    encrypted: bool,
    delay: bool,
}

fn update_stats(ctx: &StorageContext, session: &Session, reply: &Reply, flags: ReplyFlags) {
    let matched = reply.prob > 0.5;
    ctx.stats
        .lock()
        .unwrap()
        .record_request(session.epoch, matched, flags.shingle, flags.delay);

    if let Some(key) = &session.key {
        let mut key_stat = key.stat.lock().unwrap();
        key_stat.stat.record(session.cmd.cmd, matched, reply.value);
        if session.cmd.cmd == CommandKind::Check {
            key_stat.stat.update_check_ema(session.timestamp);
        }

        if let Some(ip) = session.ip() {
            if let Some(ip_stat) = key_stat.last_ips.get_mut(&ip, session.timestamp) {
                ip_stat.record(session.cmd.cmd, matched, reply.value);
            }
        }
    }
}

/// Finalizes a request: statistics, delay/forbidden blanking, encryption,
/// datagram send.
async fn make_reply(
    ctx: &StorageContext,
    socket: &UdpSocket,
    session: &Session,
    mut reply: Reply,
    flags: ReplyFlags,
) {
    reply.tag = session.cmd.tag;
    update_stats(ctx, session, &reply, flags);

    if flags.delay {
        // Hash is too fresh; answer as if unknown.
        reply.blank();
    }

    let wire_bytes = if flags.encrypted {
        if reply.prob > 0.0 {
            if let Some(key) = &session.key {
                if key.is_forbidden(reply.flag) {
                    // Hash is from a forbidden flag for this key.
                    reply.blank();
                    reply.flag = 0;
                }
            }
        }

        let Some(nm) = &session.nm else {
            error!("encrypted session without shared secret");
            return;
        };
        crate::crypto::seal_reply(nm, &reply.encode(session.epoch))
    } else {
        reply.encode(session.epoch)
    };

    let Some(addr) = session.addr else { return };
    if let Err(err) = socket.send_to(&wire_bytes, addr).await {
        error!(error = %err, "error while writing reply");
    }
}

/// Write permission: read-only denies everything; local sources, allowed
/// networks and allowed client keys may mutate.
fn check_write(ctx: &StorageContext, session: &Session) -> bool {
    if ctx.read_only {
        return false;
    }

    match session.ip() {
        // No address means a local (unix) origin.
        None => return true,
        Some(ip) => {
            if !ctx.update_ips.is_empty() && ctx.update_ips.contains(ip) {
                return true;
            }
        }
    }

    if !ctx.update_keys.is_empty() {
        if let Some(key) = &session.key {
            if ctx.update_keys.contains(&key.id().to_base32()) {
                return true;
            }
        }
    }

    false
}

fn hook_request(session: &Session) -> HookRequest<'_> {
    HookRequest {
        addr: session.ip(),
        cmd: session.cmd.cmd,
        digest: &session.cmd.digest,
        is_shingle: session.cmd.is_shingle(),
        extensions: &session.cmd.extensions,
    }
}

/// Runs the full request pipeline for one decoded session.
pub async fn process_session(ctx: Arc<StorageContext>, socket: Arc<UdpSocket>, session: Session) {
    let flags = ReplyFlags {
        shingle: session.cmd.is_shingle(),
        encrypted: session.encrypted,
        delay: false,
    };

    let mut reply = Reply {
        value: 0,
        prob: 0.0,
        flag: session.cmd.flag,
        tag: session.cmd.tag,
        ts: 0,
    };

    // Plaintext policy applies before anything else sees the command.
    if ctx.encrypted_only && !session.encrypted {
        reply.value = 403;
        reply.prob = 0.0;
        make_reply(&ctx, &socket, &session, reply, flags).await;
        return;
    }

    // Make sure the per-client stat slot exists for this key.
    if let (Some(key), Some(ip)) = (&session.key, session.ip()) {
        let mut key_stat = key.stat.lock().unwrap();
        if key_stat.last_ips.get_mut(&ip, session.timestamp).is_none() {
            key_stat
                .last_ips
                .put(ip, Default::default(), session.timestamp);
        }
    }

    if let Some(pre_handler) = ctx.hooks.pre_snapshot() {
        if let Some(decision) = pre_handler(&hook_request(&session)) {
            // Artificial reply; the backend is skipped entirely.
            reply.value = decision.value;
            reply.prob = decision.prob;
            if let Some(flag) = decision.flag {
                reply.flag = flag;
            }
            make_reply(&ctx, &socket, &session, reply, flags).await;
            return;
        }
    }

    match session.cmd.cmd {
        CommandKind::Check => {
            let mut can_continue = true;
            let mut just_tripped = false;

            if let (Some(limiter), Some(ip)) = (&ctx.limiter, session.ip()) {
                let decision = limiter.lock().unwrap().check(ip, session.timestamp);
                if let RateLimitDecision::Deny { just_tripped: tripped } = decision {
                    just_tripped = tripped;
                    if !ctx.ratelimit_log_only {
                        can_continue = false;
                    }
                }
            }

            if just_tripped {
                ctx.hooks.notify_blacklisted(session.ip(), "ratelimit");
            }

            if !can_continue {
                reply.value = 403;
                reply.prob = 0.0;
                reply.flag = 0;
                make_reply(&ctx, &socket, &session, reply, flags).await;
                return;
            }

            // The session stays retained across the backend call.
            let backend = ctx.backend();
            let result = match backend.check(&session.cmd).await {
                Ok(result) => result,
                Err(err) => {
                    error!(error = %err, "backend check failed");
                    crate::backend::BackendReply::not_found(session.cmd.digest)
                }
            };

            reply.value = result.value;
            reply.prob = result.prob;
            reply.flag = result.flag;
            reply.ts = result.ts;

            let mut flags = flags;

            if let Some(post_handler) = ctx.hooks.post_snapshot() {
                if let Some(decision) = post_handler(&hook_request(&session), &reply) {
                    reply.value = decision.value;
                    reply.prob = decision.prob;
                    if let Some(flag) = decision.flag {
                        reply.flag = flag;
                    }
                    make_reply(&ctx, &socket, &session, reply, flags).await;
                    return;
                }
            }

            if !ctx.delay.is_nan()
                && session
                    .ip()
                    .map(|ip| !ctx.delay_whitelist.contains(ip))
                    .unwrap_or(false)
            {
                let hash_age = session.timestamp - result.ts as f64;
                let jittered_age = ctx.delay * rand::rng().random_range(0.5..1.5);
                if hash_age < jittered_age {
                    flags.delay = true;
                }
            }

            // A strong hit refreshes the stored hash's lifetime.
            if reply.prob > 0.9 && !ctx.read_only {
                let mut refresh = session.cmd.clone();
                refresh.cmd = CommandKind::Refresh;
                refresh.flag = reply.flag;
                refresh.tag = 0;
                refresh.digest = result.digest;
                refresh.extensions = Vec::new();
                ctx.updates.enqueue(refresh);
            }

            make_reply(&ctx, &socket, &session, reply, flags).await;
        }

        CommandKind::Stat => {
            reply.value = 0;
            reply.prob = 1.0;
            reply.flag = ctx.stats.lock().unwrap().hashes_stored as u32;
            make_reply(&ctx, &socket, &session, reply, flags).await;
        }

        CommandKind::Write | CommandKind::Del | CommandKind::Refresh => {
            if check_write(&ctx, &session) {
                if session.cmd.cmd == CommandKind::Write
                    && !ctx.skip_hashes.is_empty()
                    && ctx.skip_hashes.contains(&hex::encode(session.cmd.digest))
                {
                    reply.value = 401;
                    reply.prob = 0.0;
                } else {
                    let mut update = session.cmd.clone();
                    update.extensions = Vec::new();
                    ctx.updates.enqueue(update);
                    reply.value = 0;
                    reply.prob = 1.0;
                }
            } else {
                reply.value = 403;
                reply.prob = 0.0;
            }
            make_reply(&ctx, &socket, &session, reply, flags).await;
        }
    }
}

/// Handles one received datagram: block list, decode, dispatch. Invalid
/// datagrams are counted and produce no reply.
pub fn handle_datagram(
    ctx: &Arc<StorageContext>,
    socket: &Arc<UdpSocket>,
    buf: &mut [u8],
    addr: SocketAddr,
) {
    if !ctx.blocked_ips.is_empty() && ctx.blocked_ips.contains(addr.ip()) {
        // Forbidden clients are dropped silently.
        ctx.hooks.notify_blacklisted(Some(addr.ip()), "blacklisted");
        return;
    }

    match decode_session(ctx, buf, Some(addr), unix_now()) {
        Ok(session) => {
            tokio::spawn(process_session(
                Arc::clone(ctx),
                Arc::clone(socket),
                session,
            ));
        }
        Err(err) => {
            debug!(code = err.as_str(), source = %addr, "invalid fuzzy command received");
            ctx.record_invalid(Some(addr.ip()));
        }
    }
}

/// The worker's UDP front end.
pub struct Server {
    ctx: Arc<StorageContext>,
    socket: Arc<UdpSocket>,
}

impl Server {
    pub async fn bind(ctx: Arc<StorageContext>, bind_addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("cannot bind fuzzy socket on {bind_addr}"))?;
        info!(addr = %socket.local_addr()?, "listening");
        Ok(Self {
            ctx,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Batched receive loop: drains up to `RECV_BATCH` datagrams per
    /// readiness wakeup until shutdown flips.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = [0u8; INPUT_BUFLEN];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                ready = self.socket.readable() => {
                    ready.context("fuzzy socket failed")?;
                    for _ in 0..RECV_BATCH {
                        match self.socket.try_recv_from(&mut buf) {
                            Ok((len, addr)) => {
                                if len == 0 {
                                    continue;
                                }
                                handle_datagram(&self.ctx, &self.socket, &mut buf[..len], addr);
                            }
                            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(err) => {
                                error!(error = %err, "got error while reading from socket");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// One worker process: context, peer pipe role, UDP server, sync timer,
/// and the final drain on shutdown.
pub struct Worker {
    pub ctx: Arc<StorageContext>,
    pub server: Option<Server>,
    sync_task: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    /// `peer` is this process's end of the inherited datagram pair, when
    /// the deployment runs more than one worker.
    pub async fn start(
        config: &Config,
        backend: Arc<dyn FuzzyBackend>,
        worker_index: usize,
        peer: Option<UnixDatagram>,
    ) -> Result<Self> {
        let is_writer = worker_index == 0;

        let (updates, queue) = if is_writer {
            let queue = Arc::new(UpdateQueue::new(config.updates_maxfail));
            if let Some(peer) = peer {
                crate::update::spawn_peer_reader(peer, Arc::clone(&queue));
            }
            (UpdateHandle::Local(Arc::clone(&queue)), Some(queue))
        } else {
            let peer = peer.context("non-zero workers need the peer pipe")?;
            (
                UpdateHandle::Peer(crate::update::PeerSender::new(peer)),
                None,
            )
        };

        let ctx = StorageContext::new(config, backend, worker_index, updates, queue)?;

        if let Ok(count) = ctx.backend().count().await {
            ctx.stats.lock().unwrap().hashes_stored = count;
        }

        let sync_task = ctx.queue.as_ref().map(|queue| {
            let backend_ctx = Arc::clone(&ctx);
            crate::update::spawn_sync_timer(
                Arc::clone(queue),
                move || backend_ctx.backend(),
                Arc::clone(&ctx.stats),
                ctx.sync_timeout,
            )
        });

        let serve_udp = !(is_writer && ctx.dedicated_update_worker);
        let server = if serve_udp {
            Some(Server::bind(Arc::clone(&ctx), &config.bind).await?)
        } else {
            info!("stop serving client requests in dedicated update mode");
            None
        };

        Ok(Self {
            ctx,
            server,
            sync_task,
        })
    }

    /// Serves until shutdown flips, then runs the final drain on the writer.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(server) = &self.server {
            server.run_until(shutdown).await?;
        } else {
            let mut shutdown = shutdown;
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        }

        if let Some(task) = self.sync_task {
            task.abort();
        }

        if let Some(queue) = &self.ctx.queue {
            if queue.pending_len() > 0 {
                info!("final sync before exit");
                queue
                    .drain(&self.ctx.backend(), &self.ctx.stats, true)
                    .await;
            }
        }

        self.ctx.backend().close().await;
        Ok(())
    }
}
