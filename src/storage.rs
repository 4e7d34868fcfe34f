//! On-disk layout and the file-backed event journal.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::event::{PersistedEvent, PersistenceId};
use crate::journal::{EventJournal, check_next_sequence_nr};

const EVENTS_FILE: &str = "events.jsonl";

/// Manages the on-disk directory layout for entity streams and snapshots.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <aggregate_type>/
///             <entity_id>/
///                 events.jsonl    -- one PersistedEvent per line
///     snapshots/
///         <aggregate_type>/
///             <entity_id>/
///                 snapshot-<seq>.json
///     meta/
///         streams.jsonl           -- stream registry
/// ```
///
/// `StreamLayout` is cheap to clone (it wraps a single `PathBuf`) and provides
/// path helpers plus stream lifecycle management (creation and listing).
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

/// Refuse identifiers that would escape or alias their directory.
fn path_component(value: &str) -> io::Result<&str> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if invalid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{value:?} cannot be used as a path component"),
        ));
    }
    Ok(value)
}

impl StreamLayout {
    /// Create a new `StreamLayout` rooted at the given base directory.
    ///
    /// The directory does not need to exist yet; it is created lazily when
    /// [`ensure_stream`](StreamLayout::ensure_stream) is called.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams/<aggregate_type>/<entity_id>`
    ///
    /// # Errors
    ///
    /// Returns `io::ErrorKind::InvalidInput` if either part of the id is
    /// empty, `.`/`..`, or contains a path separator.
    pub fn stream_dir(&self, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        self.entity_dir("streams", persistence_id)
    }

    /// `<base_dir>/streams/<aggregate_type>/<entity_id>/events.jsonl`
    ///
    /// # Errors
    ///
    /// Same as [`stream_dir`](StreamLayout::stream_dir).
    pub fn events_path(&self, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        Ok(self.stream_dir(persistence_id)?.join(EVENTS_FILE))
    }

    /// `<base_dir>/snapshots/<aggregate_type>/<entity_id>`
    ///
    /// # Errors
    ///
    /// Same as [`stream_dir`](StreamLayout::stream_dir).
    pub fn snapshot_dir(&self, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        self.entity_dir("snapshots", persistence_id)
    }

    /// `<base_dir>/meta`
    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    fn entity_dir(&self, root: &str, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        Ok(self
            .base_dir
            .join(root)
            .join(path_component(&persistence_id.entity_type)?)
            .join(path_component(&persistence_id.entity_id)?))
    }

    /// Ensures that the stream directory and registry entry exist for the
    /// given entity.
    ///
    /// This method is **idempotent**: calling it multiple times with the same
    /// arguments will not create duplicate directory trees or registry entries.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if the id is not a valid path component or
    /// directory creation or file I/O fails.
    pub fn ensure_stream(&self, persistence_id: &PersistenceId) -> io::Result<PathBuf> {
        let dir = self.stream_dir(persistence_id)?;
        fs::create_dir_all(&dir)?;

        let meta = self.meta_dir();
        fs::create_dir_all(&meta)?;

        let registry_path = meta.join("streams.jsonl");
        let entity_type = persistence_id.entity_type.as_str();
        let entity_id = persistence_id.entity_id.as_str();

        // If the registry file doesn't exist yet, skip straight to appending.
        let already_registered = registry_path
            .exists()
            .then(|| -> io::Result<bool> {
                let reader = BufReader::new(fs::File::open(&registry_path)?);
                for line in reader.lines() {
                    let line = line?;
                    if line.is_empty() {
                        continue;
                    }
                    if let Ok(entry) = serde_json::from_str::<serde_json::Value>(&line)
                        && entry.get("type").and_then(|v| v.as_str()) == Some(entity_type)
                        && entry.get("id").and_then(|v| v.as_str()) == Some(entity_id)
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .transpose()?
            .unwrap_or(false);

        if !already_registered {
            let entry = serde_json::json!({
                "type": entity_type,
                "id": entity_id,
                "ts": chrono::Utc::now().timestamp(),
            });

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&registry_path)?;
            writeln!(file, "{entry}")?;
        }

        Ok(dir)
    }

    /// Lists all entity ids with a stream directory for the given
    /// aggregate type, sorted.
    ///
    /// Returns an empty vector if the aggregate type directory does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_streams(&self, aggregate_type: &str) -> io::Result<Vec<String>> {
        list_subdirs(&self.base_dir.join("streams").join(path_component(aggregate_type)?))
    }

    /// Lists the aggregate types that have at least one stream directory.
    ///
    /// # Errors
    ///
    /// Returns `std::io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_aggregate_types(&self) -> io::Result<Vec<String>> {
        list_subdirs(&self.base_dir.join("streams"))
    }
}

fn list_subdirs(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry
                .file_type()
                .ok()?
                .is_dir()
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
        .collect();

    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------------
// File journal
// ---------------------------------------------------------------------------

/// Event journal storing each stream as a JSON-lines file.
///
/// Every append is flushed with `sync_data` before it resolves. All blocking
/// file I/O runs on tokio's blocking pool. A trailing line without a newline
/// (a write torn by a crash) is ignored on read and truncated before the
/// next append.
///
/// Appends to one stream are serialized by that stream's lock; different
/// streams write independently. The journal remembers each stream's length
/// and last sequence number, so an append only rescans the file when its
/// length on disk no longer matches.
#[derive(Debug, Clone)]
pub struct FileJournal {
    layout: StreamLayout,
    streams: Arc<Mutex<HashMap<PersistenceId, StreamLock>>>,
}

/// Per-stream write lock guarding the stream's cached tail.
type StreamLock = Arc<Mutex<Option<StreamTail>>>;

/// End of the intact part of a stream file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StreamTail {
    /// Bytes up to and including the last newline.
    len: u64,
    /// Sequence number of the last complete record, `0` if none.
    highest: u64,
}

/// The one field needed to position a line within its stream.
#[derive(Deserialize)]
struct SequenceNrOnly {
    sequence_nr: u64,
}

fn poisoned() -> io::Error {
    io::Error::other("journal stream lock poisoned")
}

impl FileJournal {
    /// Journal rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The directory layout used by this journal.
    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn stream_lock(&self, persistence_id: &PersistenceId) -> io::Result<StreamLock> {
        let mut streams = self.streams.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(streams.entry(persistence_id.clone()).or_default()))
    }

    async fn blocking<T, F>(&self, f: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(StreamLayout) -> io::Result<T> + Send + 'static,
    {
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || f(layout))
            .await
            .map_err(io::Error::other)?
    }
}

/// Read a stream file and return its intact prefix (everything up to and
/// including the last newline).
fn read_intact(path: &Path) -> io::Result<Vec<u8>> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let intact = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    if intact < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            torn_bytes = bytes.len() - intact,
            "ignoring incomplete trailing record"
        );
        bytes.truncate(intact);
    }
    Ok(bytes)
}

fn invalid_line(path: &Path, index: usize, e: serde_json::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: line {}: {e}", path.display(), index + 1),
    )
}

/// Parse the records at or after `from_sequence_nr`. Earlier lines are only
/// read far enough to learn their sequence number.
fn read_stream_file(path: &Path, from_sequence_nr: u64) -> io::Result<Vec<PersistedEvent>> {
    let bytes = read_intact(path)?;
    let mut records = Vec::new();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let position = serde_json::from_slice::<SequenceNrOnly>(line)
            .map_err(|e| invalid_line(path, index, e))?;
        if position.sequence_nr < from_sequence_nr {
            continue;
        }
        let record = serde_json::from_slice::<PersistedEvent>(line)
            .map_err(|e| invalid_line(path, index, e))?;
        records.push(record);
    }
    Ok(records)
}

/// Locate the end of a stream file, parsing only its last record.
fn scan_tail(path: &Path) -> io::Result<StreamTail> {
    let bytes = read_intact(path)?;
    let last = bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .last();
    let highest = match last {
        Some((index, line)) => {
            serde_json::from_slice::<SequenceNrOnly>(line)
                .map_err(|e| invalid_line(path, index, e))?
                .sequence_nr
        }
        None => 0,
    };
    Ok(StreamTail {
        len: bytes.len() as u64,
        highest,
    })
}

fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// The cached tail if the file still has the length it was left with,
/// otherwise a fresh scan. Returns the tail and the file's length on disk.
fn current_tail(path: &Path, cached: Option<StreamTail>) -> io::Result<(StreamTail, u64)> {
    let on_disk = file_len(path)?;
    let tail = match cached {
        Some(tail) if tail.len == on_disk => tail,
        _ => scan_tail(path)?,
    };
    Ok((tail, on_disk))
}

fn append_to_stream(
    layout: &StreamLayout,
    cached: &mut Option<StreamTail>,
    record: &PersistedEvent,
) -> io::Result<u64> {
    if cached.is_none() {
        layout.ensure_stream(&record.persistence_id)?;
    }
    let path = layout.events_path(&record.persistence_id)?;
    let (tail, on_disk) = current_tail(&path, cached.take())?;
    *cached = Some(tail);
    check_next_sequence_nr(record, tail.highest)?;

    let mut line = serde_json::to_vec(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');

    // Unknown until the write is durable; a failed write forces a rescan.
    *cached = None;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if on_disk > tail.len {
        file.set_len(tail.len)?;
    }
    file.write_all(&line)?;
    file.sync_data()?;
    *cached = Some(StreamTail {
        len: tail.len + line.len() as u64,
        highest: record.sequence_nr,
    });
    Ok(record.sequence_nr)
}

impl EventJournal for FileJournal {
    async fn append(&self, record: PersistedEvent) -> io::Result<u64> {
        let stream = self.stream_lock(&record.persistence_id)?;
        self.blocking(move |layout| {
            let mut cached = stream.lock().map_err(|_| poisoned())?;
            append_to_stream(&layout, &mut cached, &record)
        })
        .await
    }

    async fn read_from(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> io::Result<Vec<PersistedEvent>> {
        let stream = self.stream_lock(persistence_id)?;
        let persistence_id = persistence_id.clone();
        self.blocking(move |layout| {
            let _guard = stream.lock().map_err(|_| poisoned())?;
            read_stream_file(&layout.events_path(&persistence_id)?, from_sequence_nr)
        })
        .await
    }

    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> io::Result<u64> {
        let stream = self.stream_lock(persistence_id)?;
        let persistence_id = persistence_id.clone();
        self.blocking(move |layout| {
            let mut cached = stream.lock().map_err(|_| poisoned())?;
            let (tail, _) = current_tail(&layout.events_path(&persistence_id)?, *cached)?;
            *cached = Some(tail);
            Ok(tail.highest)
        })
        .await
    }

    async fn events_by_tag(&self, tag: &str) -> io::Result<Vec<PersistedEvent>> {
        let tag = tag.to_owned();
        self.blocking(move |layout| {
            let mut tagged = Vec::new();
            for entity_type in layout.list_aggregate_types()? {
                for entity_id in layout.list_streams(&entity_type)? {
                    let persistence_id = PersistenceId {
                        entity_type: entity_type.clone(),
                        entity_id,
                    };
                    let records = read_stream_file(&layout.events_path(&persistence_id)?, 0)?;
                    tagged.extend(records.into_iter().filter(|r| r.tags.contains(&tag)));
                }
            }
            Ok(tagged)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::ShoppingCart;
    use crate::journal::test_support::item_added_record;
    use std::time::Duration;
    use tempfile::TempDir;

    fn pid(id: &str) -> PersistenceId {
        PersistenceId::of::<ShoppingCart>(id)
    }

    #[test]
    fn path_helpers_correct() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());

        assert_eq!(layout.base_dir(), tmp.path());
        assert_eq!(
            layout.stream_dir(&pid("abc-123")).unwrap(),
            tmp.path().join("streams/ShoppingCart/abc-123")
        );
        assert_eq!(
            layout.events_path(&pid("abc-123")).unwrap(),
            tmp.path().join("streams/ShoppingCart/abc-123/events.jsonl")
        );
        assert_eq!(
            layout.snapshot_dir(&pid("abc-123")).unwrap(),
            tmp.path().join("snapshots/ShoppingCart/abc-123")
        );
        assert_eq!(layout.meta_dir(), tmp.path().join("meta"));
    }

    #[test]
    fn unsafe_ids_are_refused() {
        let layout = StreamLayout::new("/tmp/unused");
        for id in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            let err = layout.stream_dir(&pid(id)).expect_err("id must be refused");
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "id {id:?}");
        }
    }

    #[test]
    fn ensure_stream_idempotent() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());

        let dir = layout.ensure_stream(&pid("abc-123")).expect("first");
        layout.ensure_stream(&pid("abc-123")).expect("second");
        assert!(dir.is_dir(), "stream directory should exist on disk");

        let registry = tmp.path().join("meta/streams.jsonl");
        let contents = fs::read_to_string(&registry).expect("failed to read registry");
        let matching = contents
            .lines()
            .filter(|line| {
                let v: serde_json::Value =
                    serde_json::from_str(line).expect("line should be valid JSON");
                v.get("type").and_then(|t| t.as_str()) == Some("ShoppingCart")
                    && v.get("id").and_then(|i| i.as_str()) == Some("abc-123")
                    && v.get("ts").and_then(|t| t.as_i64()).is_some()
            })
            .count();
        assert_eq!(matching, 1, "registry should contain exactly one entry");
    }

    #[test]
    fn list_streams_sorted_and_empty_for_unknown_type() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let layout = StreamLayout::new(tmp.path());
        assert!(layout.list_streams("ShoppingCart").unwrap().is_empty());

        for id in ["charlie", "alpha", "bravo"] {
            layout.ensure_stream(&pid(id)).expect("ensure_stream");
        }
        assert_eq!(
            layout.list_streams("ShoppingCart").unwrap(),
            vec!["alpha", "bravo", "charlie"]
        );
        assert_eq!(layout.list_aggregate_types().unwrap(), vec!["ShoppingCart"]);
    }

    #[tokio::test]
    async fn file_journal_append_and_read() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        for seq in 1..=3 {
            journal
                .append(item_added_record("cart-1", seq))
                .await
                .expect("append should succeed");
        }

        let records = journal.read_from(&pid("cart-1"), 2).await.expect("read");
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(journal.highest_sequence_nr(&pid("cart-1")).await.unwrap(), 3);

        let reopened = FileJournal::new(tmp.path());
        assert_eq!(reopened.read_from(&pid("cart-1"), 1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn file_journal_rejects_non_contiguous() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        journal.append(item_added_record("cart-1", 1)).await.unwrap();

        let dup = journal.append(item_added_record("cart-1", 1)).await.unwrap_err();
        assert_eq!(dup.kind(), io::ErrorKind::AlreadyExists);
        let gap = journal.append(item_added_record("cart-1", 5)).await.unwrap_err();
        assert_eq!(gap.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_ignored_then_truncated() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        journal.append(item_added_record("cart-1", 1)).await.unwrap();

        let path = journal.layout().events_path(&pid("cart-1")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"event_id\":\"trunc").unwrap();
        drop(file);

        assert_eq!(journal.read_from(&pid("cart-1"), 1).await.unwrap().len(), 1);
        journal
            .append(item_added_record("cart-1", 2))
            .await
            .expect("append after torn write should succeed");

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(!contents.contains("trunc"));
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_an_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        journal.append(item_added_record("cart-1", 1)).await.unwrap();

        let path = journal.layout().events_path(&pid("cart-1")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage\n").unwrap();
        drop(file);

        let err = journal.read_from(&pid("cart-1"), 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    /// Overwrite record 1's `recorded_at` in place, keeping the file length.
    fn corrupt_first_timestamp(path: &Path) {
        let contents = fs::read_to_string(path).unwrap();
        let key = "\"recorded_at\":\"";
        let start = contents.find(key).unwrap() + key.len();
        let end = start + contents[start..].find('"').unwrap();
        let mut corrupted = contents.clone();
        corrupted.replace_range(start..end, &"x".repeat(end - start));
        fs::write(path, corrupted).unwrap();
    }

    #[tokio::test]
    async fn append_and_tail_reads_skip_earlier_records() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        for seq in 1..=2 {
            journal.append(item_added_record("cart-1", seq)).await.unwrap();
        }
        let path = journal.layout().events_path(&pid("cart-1")).unwrap();
        corrupt_first_timestamp(&path);

        journal
            .append(item_added_record("cart-1", 3))
            .await
            .expect("append should not decode earlier records");
        let tail = journal.read_from(&pid("cart-1"), 2).await.expect("read tail");
        let seqs: Vec<u64> = tail.iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(journal.highest_sequence_nr(&pid("cart-1")).await.unwrap(), 3);

        let err = journal.read_from(&pid("cart-1"), 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn external_append_is_noticed() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let first = FileJournal::new(tmp.path());
        let second = FileJournal::new(tmp.path());
        first.append(item_added_record("cart-1", 1)).await.unwrap();
        second.append(item_added_record("cart-1", 2)).await.unwrap();

        let dup = first.append(item_added_record("cart-1", 2)).await.unwrap_err();
        assert_eq!(dup.kind(), io::ErrorKind::AlreadyExists);
        first.append(item_added_record("cart-1", 3)).await.unwrap();
        assert_eq!(second.read_from(&pid("cart-1"), 1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn streams_do_not_wait_on_each_other() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        let lock = journal.stream_lock(&pid("cart-1")).unwrap();
        let held = lock.lock().unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            journal.append(item_added_record("cart-2", 1)),
        )
        .await
        .expect("cart-2 must not wait for cart-1's lock")
        .expect("append should succeed");

        drop(held);
        journal.append(item_added_record("cart-1", 1)).await.unwrap();
        assert_eq!(journal.highest_sequence_nr(&pid("cart-1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_journal_events_by_tag() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let journal = FileJournal::new(tmp.path());
        journal.append(item_added_record("cart-1", 1)).await.unwrap();
        journal.append(item_added_record("cart-2", 1)).await.unwrap();
        journal.append(item_added_record("cart-1", 2)).await.unwrap();

        let shard6 = journal.events_by_tag("ShoppingCartEvent6").await.unwrap();
        let seqs: Vec<u64> = shard6.iter().map(|r| r.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(shard6.iter().all(|r| r.metadata.entity_id == "cart-1"));
        assert_eq!(journal.events_by_tag("ShoppingCartEvent5").await.unwrap().len(), 1);
    }
}
