use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_bind() -> String {
    "0.0.0.0:11335".to_string()
}
fn default_sync() -> f64 {
    60.0
}
fn default_expire() -> f64 {
    // 90 days, matching the upstream hash lifetime.
    90.0 * 86400.0
}
fn default_delay() -> f64 {
    f64::NAN
}
fn default_keypair_cache_size() -> usize {
    512
}
fn default_updates_maxfail() -> u32 {
    3
}
fn default_max_buckets() -> usize {
    2000
}
fn default_network_mask() -> u32 {
    24
}
fn default_bucket_ttl() -> f64 {
    3600.0
}
fn default_nan() -> f64 {
    f64::NAN
}

/// One configured keypair: hex-encoded X25519 secret plus the hash flags
/// this key must never see in replies.
#[derive(Clone, Deserialize)]
pub struct KeypairConfig {
    pub secret: String,
    #[serde(default)]
    pub forbidden_ids: Vec<u32>,
}

impl std::fmt::Debug for KeypairConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeypairConfig")
            .field("secret", &"<redacted>")
            .field("forbidden_ids", &self.forbidden_ids)
            .finish()
    }
}

/// Worker configuration, loaded from a TOML file. Every field has a default
/// so a minimal config is just a bind line.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Seconds between update-queue drains.
    #[serde(default = "default_sync")]
    pub sync: f64,

    /// Hash lifetime hint forwarded to the backend.
    #[serde(default = "default_expire")]
    pub expire: f64,

    /// Young hashes are hidden for roughly this many seconds (NaN disables).
    #[serde(default = "default_delay")]
    pub delay: f64,

    /// Networks allowed to send WRITE/DEL.
    #[serde(default)]
    pub allow_update: Vec<String>,

    /// Base32 key ids allowed to send WRITE/DEL over encrypted transport.
    #[serde(default)]
    pub allow_update_keys: Vec<String>,

    /// Networks exempt from the young-hash delay.
    #[serde(default)]
    pub delay_whitelist: Vec<String>,

    #[serde(default)]
    pub keypair: Vec<KeypairConfig>,

    #[serde(default = "default_keypair_cache_size")]
    pub keypair_cache_size: usize,

    #[serde(default)]
    pub encrypted_only: bool,

    /// Worker 0 stops serving UDP and only drains updates.
    #[serde(default)]
    pub dedicated_update_worker: bool,

    #[serde(default)]
    pub read_only: bool,

    /// Networks whose datagrams are dropped silently.
    #[serde(default)]
    pub blocked: Vec<String>,

    #[serde(default = "default_updates_maxfail")]
    pub updates_maxfail: u32,

    /// Hex digests never accepted for WRITE.
    #[serde(default)]
    pub skip_hashes: Vec<String>,

    #[serde(default)]
    pub ratelimit_whitelist: Vec<String>,

    #[serde(default = "default_max_buckets")]
    pub ratelimit_max_buckets: usize,

    #[serde(default = "default_network_mask")]
    pub ratelimit_network_mask: u32,

    #[serde(default = "default_bucket_ttl")]
    pub ratelimit_bucket_ttl: f64,

    /// Requests leaked per second; NaN disables rate limiting.
    #[serde(default = "default_nan")]
    pub ratelimit_rate: f64,

    /// Bucket capacity before a source is latched out; NaN disables.
    #[serde(default = "default_nan")]
    pub ratelimit_burst: f64,

    /// Compute ratelimit decisions but never deny.
    #[serde(default)]
    pub ratelimit_log_only: bool,

    /// Path for the admin control socket; unset disables it.
    #[serde(default)]
    pub control_socket: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must satisfy the defaults")
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("cannot parse config file {}", path.display()))
    }

    /// True when rate limiting is configured on.
    pub fn ratelimit_enabled(&self) -> bool {
        !self.ratelimit_rate.is_nan() && !self.ratelimit_burst.is_nan()
    }
}
