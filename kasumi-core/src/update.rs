use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixDatagram;
use tracing::{debug, error, info, warn};

use crate::backend::FuzzyBackend;
use crate::stats::GlobalStats;
use crate::wire::{self, Command};

/// Name reported to the backend for locally originated batches.
pub const LOCAL_SOURCE: &str = "local";

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing pending, nothing done.
    Idle,
    /// Batch committed.
    Committed,
    /// Commit failed; the batch went back to the queue for a later retry.
    Retrying,
    /// Commit failed too many times; the batch was discarded.
    Dropped,
}

/// The single writer's pending mutation queue. Owned by worker 0; mutations
/// arrive either directly from local sessions or via the peer pipe.
pub struct UpdateQueue {
    pending: Mutex<Vec<Command>>,
    updates_failed: Mutex<u32>,
    updates_maxfail: u32,
}

impl UpdateQueue {
    pub fn new(updates_maxfail: u32) -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(1024)),
            updates_failed: Mutex::new(0),
            updates_maxfail,
        }
    }

    pub fn enqueue(&self, cmd: Command) {
        self.pending.lock().unwrap().push(cmd);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Consecutive failed commits so far; reset on success or discard.
    pub fn failed_count(&self) -> u32 {
        *self.updates_failed.lock().unwrap()
    }

    /// Swaps out the pending batch. The queue is immediately writable again
    /// while the transaction is in flight.
    fn take_batch(&self) -> Vec<Command> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    /// Puts a failed transaction back. The batch lands at the tail, behind
    /// anything that arrived while the commit was in flight.
    fn requeue(&self, batch: Vec<Command>) {
        let mut pending = self.pending.lock().unwrap();
        pending.reserve(batch.len());
        pending.extend(batch);
    }

    /// One drain cycle: swap the queue into a transaction and commit it.
    ///
    /// With `final_drain` set the failure path retries immediately until the
    /// batch commits or exhausts `updates_maxfail`; the caller breaks its
    /// loop afterwards either way.
    pub async fn drain(
        &self,
        backend: &Arc<dyn FuzzyBackend>,
        stats: &Mutex<GlobalStats>,
        final_drain: bool,
    ) -> DrainOutcome {
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                return DrainOutcome::Idle;
            }

            match backend.process_updates(&batch, LOCAL_SOURCE).await {
                Ok(outcome) => {
                    if let Ok(count) = backend.count().await {
                        stats.lock().unwrap().hashes_stored = count;
                    }
                    *self.updates_failed.lock().unwrap() = 0;
                    info!(
                        committed = batch.len(),
                        pending = self.pending_len(),
                        added = outcome.added,
                        deleted = outcome.deleted,
                        extended = outcome.extended,
                        ignored = outcome.ignored,
                        "successfully updated fuzzy storage"
                    );
                    let _ = backend.version(LOCAL_SOURCE).await;
                    return DrainOutcome::Committed;
                }
                Err(err) => {
                    let failed = {
                        let mut counter = self.updates_failed.lock().unwrap();
                        *counter += 1;
                        *counter
                    };

                    if failed > self.updates_maxfail {
                        error!(
                            discarded = batch.len(),
                            retries = self.updates_maxfail,
                            error = %err,
                            "cannot commit update transaction, discarding batch"
                        );
                        *self.updates_failed.lock().unwrap() = 0;
                        return DrainOutcome::Dropped;
                    }

                    error!(
                        left = batch.len(),
                        pending = self.pending_len(),
                        retries_remaining = self.updates_maxfail - failed,
                        error = %err,
                        "cannot commit update transaction"
                    );
                    // Tail re-append: in-flight updates line up behind
                    // anything that arrived during the commit.
                    self.requeue(batch);

                    if final_drain {
                        continue;
                    }
                    return DrainOutcome::Retrying;
                }
            }
        }
    }
}

/// Where a worker sends its mutations: worker 0 appends to its own queue,
/// everyone else forwards one command per datagram to worker 0.
#[derive(Clone)]
pub enum UpdateHandle {
    Local(Arc<UpdateQueue>),
    Peer(PeerSender),
}

impl UpdateHandle {
    pub fn enqueue(&self, cmd: Command) {
        match self {
            Self::Local(queue) => queue.enqueue(cmd),
            Self::Peer(sender) => sender.send(cmd),
        }
    }
}

/// Write end of the peer pipe held by non-zero workers.
#[derive(Clone)]
pub struct PeerSender {
    socket: Arc<UnixDatagram>,
}

impl PeerSender {
    pub fn new(socket: UnixDatagram) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// Forwards one mutation. A full pipe parks the frame on a task that
    /// waits for writability; a hard error drops the command.
    pub fn send(&self, mut cmd: Command) {
        // Source extensions are session-local; they never cross the pipe.
        cmd.extensions.clear();
        let frame = wire::encode_command(&cmd);

        match self.socket.try_send(&frame) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                let socket = Arc::clone(&self.socket);
                tokio::spawn(async move {
                    loop {
                        if socket.writable().await.is_err() {
                            error!("peer pipe closed while waiting for writability");
                            return;
                        }
                        match socket.try_send(&frame) {
                            Ok(_) => return,
                            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                            Err(err) => {
                                error!(error = %err, "cannot send update request to the peer");
                                return;
                            }
                        }
                    }
                });
            }
            Err(err) => {
                error!(error = %err, "cannot send update request to the peer");
            }
        }
    }
}

/// Worker 0's read side: every received frame is appended to the pending
/// queue in arrival order.
pub fn spawn_peer_reader(socket: UnixDatagram, queue: Arc<UpdateQueue>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            match socket.recv(&mut buf).await {
                Ok(0) => {
                    debug!("peer pipe closed");
                    return;
                }
                Ok(len) => match wire::parse_command(&buf[..len]) {
                    Ok((cmd, _)) => queue.enqueue(cmd),
                    Err(err) => warn!(code = err.as_str(), "bad peer command frame"),
                },
                Err(err) => {
                    error!(error = %err, "cannot read command from peers");
                    return;
                }
            }
        }
    });
}

/// Periodic drain driving the sync timer. The backend is looked up per
/// tick so a RELOAD swap takes effect on the next cycle.
pub fn spawn_sync_timer<F>(
    queue: Arc<UpdateQueue>,
    backend_source: F,
    stats: Arc<Mutex<GlobalStats>>,
    sync_timeout: f64,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Arc<dyn FuzzyBackend> + Send + 'static,
{
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(sync_timeout.max(1.0));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a fresh worker does
        // not commit an empty transaction at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let backend = backend_source();
            if let Ok(count) = backend.count().await {
                stats.lock().unwrap().hashes_stored = count;
            }
            queue.drain(&backend, &stats, false).await;
        }
    })
}
