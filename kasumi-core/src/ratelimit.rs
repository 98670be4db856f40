use std::net::IpAddr;

use tracing::info;

use crate::cache::TtlLru;
use crate::maps::{IpNetMap, mask_v4, mask_v6};

/// Leaky bucket state for one masked source. `cur == NaN` marks a source
/// that has tripped the limit; the marker survives until TTL eviction.
#[derive(Debug, Clone, Copy)]
struct LeakyBucket {
    last: f64,
    cur: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    /// Denied. `just_tripped` is set on the request that pushed the bucket
    /// over its burst, which is when the blacklist hook fires.
    Deny {
        just_tripped: bool,
    },
}

impl RateLimitDecision {
    pub fn allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Per-source leaky-bucket rate limiter with whitelist bypass.
pub struct RateLimiter {
    buckets: TtlLru<IpAddr, LeakyBucket>,
    whitelist: IpNetMap,
    rate: f64,
    burst: f64,
    mask: u32,
}

impl RateLimiter {
    /// Returns `None` when rate limiting is disabled (rate or burst unset).
    pub fn new(
        rate: f64,
        burst: f64,
        mask: u32,
        max_buckets: usize,
        bucket_ttl: f64,
        whitelist: IpNetMap,
    ) -> Option<Self> {
        if rate.is_nan() || burst.is_nan() {
            return None;
        }
        Some(Self {
            buckets: TtlLru::new(max_buckets, Some(bucket_ttl)),
            whitelist,
            rate,
            burst,
            mask,
        })
    }

    fn masked(&self, addr: IpAddr) -> IpAddr {
        match addr {
            IpAddr::V4(v4) => IpAddr::V4(mask_v4(v4, self.mask.min(32))),
            // IPv6 sources are limited per-network, at least /64.
            IpAddr::V6(v6) => IpAddr::V6(mask_v6(v6, (self.mask * 4).clamp(64, 128))),
        }
    }

    /// One CHECK admission decision for `addr` at time `now`.
    pub fn check(&mut self, addr: IpAddr, now: f64) -> RateLimitDecision {
        if self.whitelist.contains(addr) {
            return RateLimitDecision::Allow;
        }

        let masked = self.masked(addr);

        match self.buckets.get_mut(&masked, now) {
            Some(bucket) => {
                if bucket.cur.is_nan() {
                    // Tripped earlier; stays denied for the whole TTL.
                    return RateLimitDecision::Deny {
                        just_tripped: false,
                    };
                }

                if bucket.last < now {
                    bucket.cur -= self.rate * (now - bucket.last);
                    if bucket.cur < 0.0 {
                        bucket.cur = 0.0;
                    }
                }
                bucket.last = now;

                if bucket.cur >= self.burst {
                    info!(
                        source = %addr,
                        masked = %masked,
                        burst = self.burst,
                        "ratelimiting source network"
                    );
                    bucket.cur = f64::NAN;
                    RateLimitDecision::Deny { just_tripped: true }
                } else {
                    bucket.cur += 1.0;
                    RateLimitDecision::Allow
                }
            }
            None => {
                self.buckets.put(masked, LeakyBucket { last: now, cur: 1.0 }, now);
                RateLimitDecision::Allow
            }
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn sweep(&mut self, now: f64) {
        self.buckets.sweep(now);
    }
}
