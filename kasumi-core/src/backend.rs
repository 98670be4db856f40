use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::wire::{Command, CommandKind, DIGEST_LEN};

/// Lookup result reported by the backing store.
#[derive(Debug, Clone, Copy)]
pub struct BackendReply {
    pub digest: [u8; DIGEST_LEN],
    pub value: i32,
    pub prob: f32,
    pub flag: u32,
    pub ts: u64,
}

impl BackendReply {
    /// A miss for the queried digest.
    pub fn not_found(digest: [u8; DIGEST_LEN]) -> Self {
        Self {
            digest,
            value: 0,
            prob: 0.0,
            flag: 0,
            ts: 0,
        }
    }
}

/// Per-commit accounting returned by `process_updates`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub added: u32,
    pub deleted: u32,
    pub extended: u32,
    pub ignored: u32,
}

/// The durable hash store. Implementations are opaque to the worker; all
/// calls complete asynchronously on later event-loop iterations. A failed
/// `process_updates` is the retryable commit-failure path.
#[async_trait]
pub trait FuzzyBackend: Send + Sync {
    async fn count(&self) -> Result<u64>;
    async fn check(&self, cmd: &Command) -> Result<BackendReply>;
    async fn process_updates(&self, updates: &[Command], source: &str) -> Result<UpdateOutcome>;
    async fn version(&self, source: &str) -> Result<u64>;
    fn id(&self) -> String;
    async fn close(&self);
}

#[derive(Debug, Clone, Copy)]
struct StoredHash {
    flag: u32,
    ts: u64,
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Hash-table backend used by the tests and the demo daemon. Supports
/// injected commit failures to exercise the retry pipeline.
#[derive(Default)]
pub struct MemoryBackend {
    hashes: Mutex<HashMap<[u8; DIGEST_LEN], StoredHash>>,
    version: AtomicU64,
    failures_left: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a stored hash, for tests.
    pub fn insert_hash(&self, digest: [u8; DIGEST_LEN], flag: u32, ts: u64) {
        self.hashes
            .lock()
            .unwrap()
            .insert(digest, StoredHash { flag, ts });
    }

    /// Makes the next `count` commits fail.
    pub fn inject_commit_failures(&self, count: u64) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn contains(&self, digest: &[u8; DIGEST_LEN]) -> bool {
        self.hashes.lock().unwrap().contains_key(digest)
    }

    pub fn stored_count(&self) -> u64 {
        self.hashes.lock().unwrap().len() as u64
    }
}

#[async_trait]
impl FuzzyBackend for MemoryBackend {
    async fn count(&self) -> Result<u64> {
        Ok(self.stored_count())
    }

    async fn check(&self, cmd: &Command) -> Result<BackendReply> {
        let hashes = self.hashes.lock().unwrap();
        match hashes.get(&cmd.digest) {
            Some(stored) => Ok(BackendReply {
                digest: cmd.digest,
                value: 0,
                prob: 1.0,
                flag: stored.flag,
                ts: stored.ts,
            }),
            None => Ok(BackendReply::not_found(cmd.digest)),
        }
    }

    async fn process_updates(&self, updates: &[Command], _source: &str) -> Result<UpdateOutcome> {
        let failures = self.failures_left.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures_left.store(failures - 1, Ordering::SeqCst);
            bail!("injected commit failure");
        }

        let mut outcome = UpdateOutcome::default();
        let mut hashes = self.hashes.lock().unwrap();
        let now = unix_now_secs();

        for update in updates {
            match update.cmd {
                CommandKind::Write => {
                    if let Some(stored) = hashes.get_mut(&update.digest) {
                        stored.ts = now;
                        outcome.ignored += 1;
                    } else {
                        hashes.insert(
                            update.digest,
                            StoredHash {
                                flag: update.flag,
                                ts: now,
                            },
                        );
                        outcome.added += 1;
                    }
                }
                CommandKind::Del => {
                    if hashes.remove(&update.digest).is_some() {
                        outcome.deleted += 1;
                    } else {
                        outcome.ignored += 1;
                    }
                }
                CommandKind::Refresh => {
                    if let Some(stored) = hashes.get_mut(&update.digest) {
                        stored.ts = now;
                        outcome.extended += 1;
                    } else {
                        outcome.ignored += 1;
                    }
                }
                CommandKind::Check | CommandKind::Stat => outcome.ignored += 1,
            }
        }

        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn version(&self, _source: &str) -> Result<u64> {
        Ok(self.version.load(Ordering::SeqCst))
    }

    fn id(&self) -> String {
        "memory".to_string()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_cmd(digest: [u8; DIGEST_LEN], flag: u32) -> Command {
        Command {
            version: 4,
            cmd: CommandKind::Write,
            shingles_count: 0,
            flag,
            tag: 0,
            digest,
            shingle: None,
            extensions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn check_hits_and_misses() {
        let backend = MemoryBackend::new();
        backend.insert_hash([1; DIGEST_LEN], 7, 12345);

        let mut cmd = write_cmd([1; DIGEST_LEN], 0);
        cmd.cmd = CommandKind::Check;
        let hit = backend.check(&cmd).await.unwrap();
        assert_eq!(hit.prob, 1.0);
        assert_eq!(hit.flag, 7);
        assert_eq!(hit.ts, 12345);

        cmd.digest = [2; DIGEST_LEN];
        let miss = backend.check(&cmd).await.unwrap();
        assert_eq!(miss.prob, 0.0);
    }

    #[tokio::test]
    async fn updates_apply_per_kind() {
        let backend = MemoryBackend::new();
        let mut del = write_cmd([9; DIGEST_LEN], 0);
        del.cmd = CommandKind::Del;

        let outcome = backend
            .process_updates(&[write_cmd([9; DIGEST_LEN], 1), del], "local")
            .await
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(backend.stored_count(), 0);
    }

    #[tokio::test]
    async fn injected_failures_then_success() {
        let backend = MemoryBackend::new();
        backend.inject_commit_failures(2);
        let updates = vec![write_cmd([3; DIGEST_LEN], 1)];

        assert!(backend.process_updates(&updates, "local").await.is_err());
        assert!(backend.process_updates(&updates, "local").await.is_err());
        let outcome = backend.process_updates(&updates, "local").await.unwrap();
        assert_eq!(outcome.added, 1);
    }
}
