//! When to snapshot, and which snapshots may be discarded.

/// Take a snapshot after this many persisted events.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// Keep this many of the most recent snapshots.
pub const DEFAULT_KEEP_SNAPSHOTS: u64 = 2;

/// Snapshot retention policy.
///
/// With the defaults, recovery loads at most one snapshot and replays at
/// most 100 events regardless of how long the entity has lived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCriteria {
    /// Snapshot whenever the sequence number is a multiple of this value.
    pub snapshot_every: u64,
    /// Number of most recent snapshots to retain.
    pub keep_snapshots: u64,
}

impl Default for RetentionCriteria {
    fn default() -> Self {
        Self {
            snapshot_every: DEFAULT_SNAPSHOT_EVERY,
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
        }
    }
}

impl RetentionCriteria {
    /// Snapshot every `n` events, keeping the `keep` most recent snapshots.
    pub fn snapshot_every(n: u64, keep: u64) -> Self {
        Self {
            snapshot_every: n,
            keep_snapshots: keep,
        }
    }

    /// Whether a snapshot is due once the event at `sequence_nr` is persisted.
    ///
    /// Never true for sequence number 0 or when `snapshot_every` is 0.
    pub fn should_snapshot(&self, sequence_nr: u64) -> bool {
        self.snapshot_every != 0 && sequence_nr != 0 && sequence_nr % self.snapshot_every == 0
    }

    /// Highest snapshot sequence number that may be deleted after a snapshot
    /// at `sequence_nr` has been written. `0` means nothing may be deleted.
    pub fn delete_upto(&self, sequence_nr: u64) -> u64 {
        let window = self.snapshot_every.saturating_mul(self.keep_snapshots.max(1));
        sequence_nr.saturating_sub(window)
    }
}
