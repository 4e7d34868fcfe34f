//! Snapshot persistence for entity state.
//!
//! A snapshot records an entity's state after a given sequence number, so
//! recovery only replays the events recorded after it. Stores prune old
//! snapshots according to [`RetentionCriteria`].
//!
//! [`FileSnapshotStore`] writes JSON files at
//! `<base_dir>/snapshots/<aggregate_type>/<entity_id>/snapshot-<seq>.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption from
//! crashes mid-write.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;
use crate::event::PersistenceId;
use crate::retention::RetentionCriteria;
use crate::storage::StreamLayout;

/// A point-in-time snapshot of an entity's state.
///
/// `sequence_nr` is the number of events folded into `state`, so recovery
/// resumes from `sequence_nr + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The entity state at the time of the snapshot.
    pub state: A,
    /// Sequence number of the last event folded into `state`.
    pub sequence_nr: u64,
}

/// Save/load access to entity snapshots.
pub trait SnapshotStore: Clone + Send + Sync + 'static {
    /// Store `snapshot` and discard snapshots that `retention` no longer keeps.
    fn save<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
        snapshot: &Snapshot<A>,
        retention: &RetentionCriteria,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// The snapshot with the highest sequence number, if any.
    fn load_latest<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
    ) -> impl Future<Output = io::Result<Option<Snapshot<A>>>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Snapshot store held in process memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<PersistenceId, BTreeMap<u64, serde_json::Value>>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers of the snapshots currently kept for an entity.
    pub fn sequence_nrs(&self, persistence_id: &PersistenceId) -> Vec<u64> {
        self.snapshots
            .lock()
            .map(|map| {
                map.get(persistence_id)
                    .map(|per_entity| per_entity.keys().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    async fn save<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
        snapshot: &Snapshot<A>,
        retention: &RetentionCriteria,
    ) -> io::Result<()> {
        let state = serde_json::to_value(&snapshot.state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut map = self
            .snapshots
            .lock()
            .map_err(|_| io::Error::other("snapshot store lock poisoned"))?;
        let per_entity = map.entry(persistence_id.clone()).or_default();
        per_entity.insert(snapshot.sequence_nr, state);

        let delete_upto = retention.delete_upto(snapshot.sequence_nr);
        per_entity.retain(|seq, _| *seq > delete_upto);
        Ok(())
    }

    async fn load_latest<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
    ) -> io::Result<Option<Snapshot<A>>> {
        let map = self
            .snapshots
            .lock()
            .map_err(|_| io::Error::other("snapshot store lock poisoned"))?;
        let Some((sequence_nr, state)) = map
            .get(persistence_id)
            .and_then(|per_entity| per_entity.last_key_value())
        else {
            return Ok(None);
        };
        let state = serde_json::from_value::<A>(state.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(Snapshot {
            state,
            sequence_nr: *sequence_nr,
        }))
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Snapshot store writing one JSON file per snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    /// Store snapshots under `<base_dir>/snapshots`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
        }
    }
}

/// File name for the snapshot at `sequence_nr`. Zero-padded so that
/// lexical and numeric order agree.
fn snapshot_file_name(sequence_nr: u64) -> String {
    format!("snapshot-{sequence_nr:020}.json")
}

fn parse_sequence_nr(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("snapshot-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Sequence numbers of the snapshot files in `dir`, highest first.
fn list_snapshots(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut seqs: Vec<u64> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            parse_sequence_nr(&entry.file_name().to_string_lossy())
        })
        .collect();
    seqs.sort_unstable_by(|a, b| b.cmp(a));
    Ok(seqs)
}

fn write_snapshot_file(
    dir: &Path,
    sequence_nr: u64,
    json: &[u8],
    delete_upto: u64,
) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(snapshot_file_name(sequence_nr));
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = std::fs::File::create(&tmp_path)?;
    tmp.write_all(json)?;
    tmp.sync_all()?;
    drop(tmp);
    std::fs::rename(&tmp_path, &path)?;

    for seq in list_snapshots(dir)? {
        if seq <= delete_upto {
            std::fs::remove_file(dir.join(snapshot_file_name(seq)))?;
        }
    }
    Ok(())
}

/// Read the newest snapshot in `dir` that deserializes. Corrupt files are
/// logged and skipped.
fn read_latest_snapshot<A: Aggregate>(dir: &Path) -> io::Result<Option<Snapshot<A>>> {
    for seq in list_snapshots(dir)? {
        let path = dir.join(snapshot_file_name(seq));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<Snapshot<A>>(&bytes) {
            Ok(snapshot) => return Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; trying an older one"
                );
            }
        }
    }
    Ok(None)
}

impl SnapshotStore for FileSnapshotStore {
    async fn save<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
        snapshot: &Snapshot<A>,
        retention: &RetentionCriteria,
    ) -> io::Result<()> {
        let dir = self.layout.snapshot_dir(persistence_id)?;
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let sequence_nr = snapshot.sequence_nr;
        let delete_upto = retention.delete_upto(sequence_nr);

        tokio::task::spawn_blocking(move || {
            write_snapshot_file(&dir, sequence_nr, &json, delete_upto)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn load_latest<A: Aggregate>(
        &self,
        persistence_id: &PersistenceId,
    ) -> io::Result<Option<Snapshot<A>>> {
        let dir = self.layout.snapshot_dir(persistence_id)?;
        tokio::task::spawn_blocking(move || read_latest_snapshot::<A>(&dir))
            .await
            .map_err(io::Error::other)?
    }
}
