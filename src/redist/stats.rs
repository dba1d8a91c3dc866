//! Per-shard forwarding counters and their persisted string form.
//!
//! The persisted form is `st=<S>&total=<n>&ok=<n>&err=<n>&drop=<n>&expired=<n>&mshd=<n>&et=<elapsed>`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

const TAG_STATUS: &str = "st";
const TAG_TOTAL: &str = "total";
const TAG_OK: &str = "ok";
const TAG_ERR: &str = "err";
const TAG_DROP: &str = "drop";
const TAG_EXPIRED: &str = "expired";
const TAG_MICRO_SHARD: &str = "mshd";
const TAG_ELAPSED: &str = "et";

const PAIR_DELIMITER: char = '&';
const KV_DELIMITER: char = '=';

/// Progress of a shard's snapshot transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotStatus {
    #[default]
    Unknown,
    Begin,
    InProgress,
    Finished,
    Aborted,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Unknown => "",
            SnapshotStatus::Begin => "B",
            SnapshotStatus::InProgress => "P",
            SnapshotStatus::Finished => "F",
            SnapshotStatus::Aborted => "A",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "B" => SnapshotStatus::Begin,
            "P" => SnapshotStatus::InProgress,
            "F" => SnapshotStatus::Finished,
            "A" => SnapshotStatus::Aborted,
            _ => SnapshotStatus::Unknown,
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Checkpoint {
    total: u64,
    ok: u64,
    fail: u64,
    drop: u64,
    expired: u64,
    skipped: u64,
    micro_shard_id: i32,
}

/// Forwarding counters with a restorable checkpoint.
#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    ok: AtomicU64,
    fail: AtomicU64,
    drop: AtomicU64,
    expired: AtomicU64,
    /// Snapshot entries that could not be decoded. Not persisted.
    skipped: AtomicU64,
    micro_shard_id: AtomicI32,
    last_micro_shard_id: AtomicI32,
    status: Mutex<SnapshotStatus>,
    checkpoint: Mutex<Checkpoint>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_fail(&self) {
        self.fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_drop(&self) {
        self.drop.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn ok(&self) -> u64 {
        self.ok.load(Ordering::Relaxed)
    }

    pub fn fail(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.drop.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SnapshotStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SnapshotStatus) {
        *self.status.lock() = status;
    }

    pub fn is_finished(&self) -> bool {
        self.status() == SnapshotStatus::Finished
    }

    /// Record the last micro-shard of the group just completed.
    pub fn set_micro_shard_id(&self, id: i32) {
        let prev = self.micro_shard_id.swap(id, Ordering::AcqRel);
        self.last_micro_shard_id.store(prev, Ordering::Release);
    }

    /// Last checkpointed micro-shard.
    pub fn micro_shard_id(&self) -> i32 {
        self.last_micro_shard_id.load(Ordering::Acquire)
    }

    /// Every forwarded request has been accounted for.
    pub fn all_accounted(&self) -> bool {
        self.total() == self.ok() + self.fail() + self.dropped()
    }

    /// Drop or failure percentage exceeds its threshold.
    pub fn should_abort(&self, drop_threshold: f64, err_threshold: f64) -> bool {
        let total = self.total() as f64;
        if total == 0.0 {
            return false;
        }
        (self.dropped() as f64 / total) * 100.0 > drop_threshold
            || (self.fail() as f64 / total) * 100.0 > err_threshold
    }

    pub fn save_checkpoint(&self) {
        let micro_shard_id = self.micro_shard_id.load(Ordering::Acquire);
        *self.checkpoint.lock() = Checkpoint {
            total: self.total(),
            ok: self.ok(),
            fail: self.fail(),
            drop: self.dropped(),
            expired: self.expired(),
            skipped: self.skipped(),
            micro_shard_id,
        };
        self.last_micro_shard_id.store(micro_shard_id, Ordering::Release);
    }

    pub fn restore_from_checkpoint(&self) {
        let cp = *self.checkpoint.lock();
        self.apply_checkpoint(&cp);
    }

    /// Adopt another instance's checkpoint, typically parsed from the store.
    pub fn restore(&self, other: &Stats) {
        let cp = *other.checkpoint.lock();
        *self.checkpoint.lock() = cp;
        self.apply_checkpoint(&cp);
    }

    fn apply_checkpoint(&self, cp: &Checkpoint) {
        self.total.store(cp.total, Ordering::Relaxed);
        self.ok.store(cp.ok, Ordering::Relaxed);
        self.fail.store(cp.fail, Ordering::Relaxed);
        self.drop.store(cp.drop, Ordering::Relaxed);
        self.expired.store(cp.expired, Ordering::Relaxed);
        self.skipped.store(cp.skipped, Ordering::Relaxed);
        self.micro_shard_id.store(cp.micro_shard_id, Ordering::Release);
        self.last_micro_shard_id
            .store(cp.micro_shard_id, Ordering::Release);
    }

    /// Render the persisted form.
    pub fn to_stats_string(&self, elapsed: Duration) -> String {
        format!(
            "{}={}&{}={}&{}={}&{}={}&{}={}&{}={}&{}={}&{}={:?}",
            TAG_STATUS,
            self.status(),
            TAG_TOTAL,
            self.total(),
            TAG_OK,
            self.ok(),
            TAG_ERR,
            self.fail(),
            TAG_DROP,
            self.dropped(),
            TAG_EXPIRED,
            self.expired(),
            TAG_MICRO_SHARD,
            self.micro_shard_id(),
            TAG_ELAPSED,
            elapsed,
        )
    }

    /// Parse the persisted form. Missing or malformed fields default to zero.
    pub fn parse(s: &str) -> Self {
        let mut stats = Stats::new();
        let mut micro_shard_id = 0;
        for pair in s.split(PAIR_DELIMITER) {
            let mut kv = pair.split(KV_DELIMITER);
            let (Some(k), Some(v)) = (kv.next(), kv.next()) else {
                continue;
            };
            let num = || v.parse::<u64>().unwrap_or(0);
            match k {
                TAG_STATUS => stats.set_status(SnapshotStatus::parse(v)),
                TAG_TOTAL => *stats.total.get_mut() = num(),
                TAG_OK => *stats.ok.get_mut() = num(),
                TAG_ERR => *stats.fail.get_mut() = num(),
                TAG_DROP => *stats.drop.get_mut() = num(),
                TAG_EXPIRED => *stats.expired.get_mut() = num(),
                TAG_MICRO_SHARD => micro_shard_id = v.parse::<i32>().unwrap_or(0),
                _ => {}
            }
        }
        stats.set_micro_shard_id(micro_shard_id);
        stats.save_checkpoint();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let stats = Stats::new();
        for _ in 0..5 {
            stats.incr_total();
        }
        stats.incr_ok();
        stats.incr_ok();
        stats.incr_fail();
        stats.incr_drop();
        stats.incr_expired();
        stats.set_micro_shard_id(31);
        stats.set_status(SnapshotStatus::InProgress);
        stats.save_checkpoint();

        let s = stats.to_stats_string(Duration::from_secs(2));
        assert_eq!(s, "st=P&total=5&ok=2&err=1&drop=1&expired=1&mshd=31&et=2s");

        let parsed = Stats::parse(&s);
        assert_eq!(parsed.status(), SnapshotStatus::InProgress);
        assert_eq!(parsed.total(), 5);
        assert_eq!(parsed.ok(), 2);
        assert_eq!(parsed.fail(), 1);
        assert_eq!(parsed.dropped(), 1);
        assert_eq!(parsed.expired(), 1);
        assert_eq!(parsed.micro_shard_id(), 31);
    }

    #[test]
    fn test_parse_tolerates_garbage() {
        let parsed = Stats::parse("st=A&total=x&ok&drop=3&bogus=1");
        assert_eq!(parsed.status(), SnapshotStatus::Aborted);
        assert_eq!(parsed.total(), 0);
        assert_eq!(parsed.ok(), 0);
        assert_eq!(parsed.dropped(), 3);

        let empty = Stats::parse("");
        assert_eq!(empty.status(), SnapshotStatus::Unknown);
    }

    #[test]
    fn test_checkpoint_restore() {
        let stats = Stats::new();
        stats.incr_total();
        stats.incr_ok();
        stats.set_micro_shard_id(7);
        stats.save_checkpoint();

        stats.incr_total();
        stats.incr_drop();
        stats.set_micro_shard_id(15);
        assert_eq!(stats.micro_shard_id(), 7);

        stats.restore_from_checkpoint();
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.dropped(), 0);
        assert_eq!(stats.micro_shard_id(), 7);
    }

    #[test]
    fn test_restore_from_other() {
        let persisted = Stats::parse("st=A&total=10&ok=10&err=0&drop=0&expired=2&mshd=63&et=1s");
        let stats = Stats::new();
        stats.restore(&persisted);
        assert_eq!(stats.total(), 10);
        assert_eq!(stats.ok(), 10);
        assert_eq!(stats.expired(), 2);
        assert_eq!(stats.micro_shard_id(), 63);
    }

    #[test]
    fn test_should_abort() {
        let stats = Stats::new();
        assert!(!stats.should_abort(0.0, 0.0));

        for _ in 0..100 {
            stats.incr_total();
        }
        for _ in 0..99 {
            stats.incr_ok();
        }
        assert!(!stats.should_abort(0.0, 0.01));
        stats.incr_fail();
        assert!(stats.should_abort(0.0, 0.01));
        assert!(!stats.should_abort(0.0, 1.0));
        assert!(stats.all_accounted());
    }
}
