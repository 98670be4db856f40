use std::net::IpAddr;

use crate::cache::TtlLru;
use crate::wire::{CommandKind, EPOCH_COUNT, Epoch};

/// EMA snapshots are taken at most once per this interval (seconds).
pub const KEY_STAT_INTERVAL: f64 = 3600.0;
/// Smoothing factor for the per-hour rate averages.
pub const KEY_STAT_ALPHA: f64 = 0.5;
/// Bound on tracked client addresses per key.
pub const LAST_IPS_CAPACITY: usize = 1024;

/// Exponentially weighted moving average over interval deltas.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterEma {
    pub mean: f64,
}

impl CounterEma {
    pub fn update(&mut self, value: f64, alpha: f64) {
        if self.mean == 0.0 {
            self.mean = value;
        } else {
            self.mean = self.mean * (1.0 - alpha) + value * alpha;
        }
    }
}

/// Request counters kept per key and per client address.
#[derive(Debug, Default)]
pub struct GenericStat {
    pub checked: u64,
    pub matched: u64,
    pub added: u64,
    pub deleted: u64,
    pub errors: u64,
    pub checked_ctr: CounterEma,
    pub matched_ctr: CounterEma,
    last_checked_time: f64,
    last_checked_count: u64,
    last_matched_count: u64,
}

impl GenericStat {
    /// Applies one completed request to the counters.
    pub fn record(&mut self, cmd: CommandKind, matched: bool, reply_value: i32) {
        if !matched && reply_value != 0 {
            self.errors += 1;
            return;
        }
        match cmd {
            CommandKind::Check => {
                self.checked += 1;
                if matched {
                    self.matched += 1;
                }
            }
            CommandKind::Write => self.added += 1,
            CommandKind::Del => self.deleted += 1,
            CommandKind::Stat | CommandKind::Refresh => {}
        }
    }

    /// Rolls interval deltas into the per-hour averages. Called on CHECK
    /// requests only; snapshots at most once per `KEY_STAT_INTERVAL`.
    ///
    /// Deltas go to their matching counters: checked into `checked_ctr`,
    /// matched into `matched_ctr`.
    pub fn update_check_ema(&mut self, timestamp: f64) {
        if self.last_checked_time == 0.0 {
            self.last_checked_time = timestamp;
            self.last_checked_count = self.checked;
            self.last_matched_count = self.matched;
        } else if timestamp > self.last_checked_time + KEY_STAT_INTERVAL {
            let nchecked = self.checked - self.last_checked_count;
            let nmatched = self.matched - self.last_matched_count;

            self.checked_ctr.update(nchecked as f64, KEY_STAT_ALPHA);
            self.matched_ctr.update(nmatched as f64, KEY_STAT_ALPHA);
            self.last_checked_time = timestamp;
            self.last_checked_count = self.checked;
            self.last_matched_count = self.matched;
        }
    }
}

/// Per-key statistics: the key's own counters plus a bounded table of
/// per-client-address counters.
pub struct KeyStat {
    pub stat: GenericStat,
    pub last_ips: TtlLru<IpAddr, GenericStat>,
}

impl Default for KeyStat {
    fn default() -> Self {
        Self {
            stat: GenericStat::default(),
            last_ips: TtlLru::new(LAST_IPS_CAPACITY, None),
        }
    }
}

/// Worker-wide counters, indexed by protocol epoch where applicable.
#[derive(Debug, Default)]
pub struct GlobalStats {
    pub hashes_stored: u64,
    pub hashes_expired: u64,
    pub checked: [u64; EPOCH_COUNT],
    pub shingles_checked: [u64; EPOCH_COUNT],
    pub found: [u64; EPOCH_COUNT],
    pub invalid_requests: u64,
    pub delayed_hashes: u64,
}

impl GlobalStats {
    /// Records one completed request against the epoch counters.
    pub fn record_request(&mut self, epoch: Epoch, matched: bool, is_shingle: bool, is_delayed: bool) {
        self.checked[epoch.index()] += 1;
        if matched {
            self.found[epoch.index()] += 1;
        }
        if is_shingle {
            self.shingles_checked[epoch.index()] += 1;
        }
        if is_delayed {
            self.delayed_hashes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_counted_for_failed_unmatched_replies() {
        let mut stat = GenericStat::default();
        stat.record(CommandKind::Check, false, 403);
        stat.record(CommandKind::Check, false, 0);
        stat.record(CommandKind::Check, true, 0);

        assert_eq!(stat.errors, 1);
        assert_eq!(stat.checked, 2);
        assert_eq!(stat.matched, 1);
        assert!(stat.matched <= stat.checked);
    }

    #[test]
    fn write_and_del_update_their_counters() {
        let mut stat = GenericStat::default();
        stat.record(CommandKind::Write, false, 0);
        stat.record(CommandKind::Del, false, 0);

        assert_eq!(stat.added, 1);
        assert_eq!(stat.deleted, 1);
        assert_eq!(stat.checked, 0);
    }

    #[test]
    fn ema_snapshots_once_per_interval() {
        let mut stat = GenericStat::default();
        let t0 = 1_000_000.0;

        stat.record(CommandKind::Check, true, 0);
        stat.update_check_ema(t0);
        assert_eq!(stat.checked_ctr.mean, 0.0);

        for _ in 0..10 {
            stat.record(CommandKind::Check, true, 0);
        }
        // Within the interval nothing rolls over.
        stat.update_check_ema(t0 + 10.0);
        assert_eq!(stat.checked_ctr.mean, 0.0);

        stat.update_check_ema(t0 + KEY_STAT_INTERVAL + 1.0);
        assert_eq!(stat.checked_ctr.mean, 10.0);
        assert_eq!(stat.matched_ctr.mean, 10.0);

        // Second interval with no traffic halves toward zero.
        stat.update_check_ema(t0 + 2.0 * KEY_STAT_INTERVAL + 2.0);
        assert_eq!(stat.checked_ctr.mean, 5.0);
    }

    #[test]
    fn global_counters_follow_epoch() {
        let mut global = GlobalStats::default();
        global.record_request(Epoch::Epoch11, true, true, false);
        global.record_request(Epoch::Epoch10, false, false, true);

        assert_eq!(global.checked[Epoch::Epoch11.index()], 1);
        assert_eq!(global.found[Epoch::Epoch11.index()], 1);
        assert_eq!(global.shingles_checked[Epoch::Epoch11.index()], 1);
        assert_eq!(global.checked[Epoch::Epoch10.index()], 1);
        assert_eq!(global.found[Epoch::Epoch10.index()], 0);
        assert_eq!(global.delayed_hashes, 1);
    }
}
