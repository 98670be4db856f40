pub mod backend;
pub mod cache;
pub mod config;
pub mod control;
pub mod crypto;
pub mod hooks;
pub mod keys;
pub mod maps;
pub mod ratelimit;
pub mod session;
pub mod stats;
pub mod update;
pub mod wire;

pub use backend::{BackendReply, FuzzyBackend, MemoryBackend, UpdateOutcome};
pub use config::{Config, KeypairConfig};
pub use control::{
    BackendFactory, CONTROL_RELOAD, CONTROL_STAT, CONTROL_SYNC, control_request,
    read_stat_document, spawn_control, stats_document,
};
pub use crypto::{Keypair, SharedSecret, open_reply, seal_command};
pub use hooks::{HookDecision, HookRequest, HookSet};
pub use keys::{FuzzyKey, KeyId, KeyRegistry};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use session::{Server, Session, StorageContext, Worker, unix_now};
pub use stats::{GenericStat, GlobalStats, KeyStat};
pub use update::{DrainOutcome, PeerSender, UpdateHandle, UpdateQueue};
pub use wire::{
    Command, CommandKind, Epoch, ProtocolError, Reply, ShingleBlock, SourceExtension,
};
