//! Durable event log contract and the in-memory backend.
//!
//! A journal stores each entity's events in sequence-number order. The
//! entity runtime appends one record at a time and folds it into state only
//! after [`EventJournal::append`] resolves, so a resolved append must mean
//! the record is durable.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::event::{PersistedEvent, PersistenceId};

/// Append/read access to a durable event log.
///
/// Implementations must:
///
/// - store records per entity in sequence-number order;
/// - refuse a record whose `sequence_nr` is not exactly one past the
///   stream's highest sequence number (`io::ErrorKind::AlreadyExists`
///   for a duplicate, `io::ErrorKind::InvalidInput` for a gap);
/// - report every failed write as an error, never drop or reorder.
pub trait EventJournal: Clone + Send + Sync + 'static {
    /// Append one record. Resolves with its sequence number once durable.
    fn append(&self, record: PersistedEvent) -> impl Future<Output = io::Result<u64>> + Send;

    /// Records of `persistence_id` with `sequence_nr >= from_sequence_nr`,
    /// in order.
    fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> impl Future<Output = io::Result<Vec<PersistedEvent>>> + Send;

    /// Highest stored sequence number of a stream, `0` if it is empty.
    fn highest_sequence_nr(
        &self,
        persistence_id: &PersistenceId,
    ) -> impl Future<Output = io::Result<u64>> + Send;

    /// Every record carrying `tag`. Records of the same entity keep their
    /// sequence order; order across entities is backend-specific.
    fn events_by_tag(&self, tag: &str) -> impl Future<Output = io::Result<Vec<PersistedEvent>>> + Send;
}

/// Check that `record` continues a stream whose highest sequence number is
/// `highest`.
pub(crate) fn check_next_sequence_nr(record: &PersistedEvent, highest: u64) -> io::Result<()> {
    let expected = highest + 1;
    if record.sequence_nr == expected {
        return Ok(());
    }
    let kind = if record.sequence_nr <= highest {
        io::ErrorKind::AlreadyExists
    } else {
        io::ErrorKind::InvalidInput
    };
    Err(io::Error::new(
        kind,
        format!(
            "stream {}: expected sequence number {expected}, got {}",
            record.persistence_id, record.sequence_nr
        ),
    ))
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<PersistenceId, Vec<PersistedEvent>>,
    /// Every record in global append order, for tag queries.
    log: Vec<PersistedEvent>,
}

/// Journal held in process memory.
///
/// `Clone` is cheap and clones share the same log, so a journal handed to
/// an [`EntityStore`](crate::EntityStore) can be inspected by tests or tag
/// consumers. [`set_failing`](InMemoryJournal::set_failing) makes every
/// subsequent append fail, simulating an unavailable log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<Mutex<Inner>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make appends fail (`true`) or succeed again (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total number of records across all streams.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.log.len()).unwrap_or(0)
    }

    /// Whether no record has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("journal lock poisoned"))
    }
}

impl EventJournal for InMemoryJournal {
    async fn append(&self, record: PersistedEvent) -> io::Result<u64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "journal unavailable",
            ));
        }
        let mut inner = self.lock()?;
        let highest = inner
            .streams
            .get(&record.persistence_id)
            .and_then(|stream| stream.last())
            .map_or(0, |last| last.sequence_nr);
        check_next_sequence_nr(&record, highest)?;

        let sequence_nr = record.sequence_nr;
        inner.log.push(record.clone());
        inner
            .streams
            .entry(record.persistence_id.clone())
            .or_default()
            .push(record);
        Ok(sequence_nr)
    }

    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> io::Result<Vec<PersistedEvent>> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(persistence_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|record| record.sequence_nr >= from_sequence_nr)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> io::Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(persistence_id)
            .and_then(|stream| stream.last())
            .map_or(0, |last| last.sequence_nr))
    }

    async fn events_by_tag(&self, tag: &str) -> io::Result<Vec<PersistedEvent>> {
        let inner = self.lock()?;
        Ok(inner
            .log
            .iter()
            .filter(|record| record.tags.contains(tag))
            .cloned()
            .collect())
    }
}
