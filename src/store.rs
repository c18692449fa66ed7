//! Main ChangeStore struct tying the log, index and recorder together.

use crate::changelog::{ChangeIndex, ChangeLogFile, FeedStart, LogFrame};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::recorder::{KeyLocks, StagedChange, Transaction};
use crate::types::{
    ChangeLogEntry, EntityKey, EntityType, EntryId, OpType, PayloadHash, StoreStats, Timestamp,
    Version,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Fsync the log every N commits.
    pub sync_interval: u64,

    /// How long a transaction waits for another writer on the same entity.
    pub lock_timeout: Duration,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./changelog"),
            sync_interval: ChangeLogFile::DEFAULT_SYNC_INTERVAL,
            lock_timeout: Duration::from_secs(5),
            create_if_missing: true,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"DSY\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Entries per frame when the log is rewritten.
const COMPACTION_CHUNK: usize = 10_000;

/// The change-log store.
///
/// Provides a unified interface for:
/// - Recording changes inside transactions
/// - Reading the feed in `(created_at, id)` order
/// - Pruning entries past the retention window
pub struct ChangeStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Durable log.
    log: ChangeLogFile,

    /// Committed entries in feed order.
    index: RwLock<ChangeIndex>,

    /// Per-entity version locks held by open transactions.
    key_locks: KeyLocks,

    /// Serializes commits and pruning so ids, timestamps and file appends
    /// advance together.
    commit_lock: Mutex<()>,

    clock: Arc<dyn Clock>,
}

impl ChangeStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        Self::open_or_create_with_clock(config, Arc::new(SystemClock))
    }

    /// Open or create a store that reads time from `clock`.
    pub fn open_or_create_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config, clock)
        } else if config.create_if_missing {
            Self::create(config, clock)
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::open(config, clock)
    }

    /// Open an existing store, replaying the log into memory.
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (log, frames) = ChangeLogFile::open_with_sync_interval(
            config.path.join("changes.log"),
            config.sync_interval,
        )?;
        let index = ChangeIndex::from_frames(frames);

        tracing::info!(
            path = %config.path.display(),
            entries = index.len(),
            tracked_keys = index.tracked_keys(),
            "opened change store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: RwLock::new(index),
            key_locks: KeyLocks::new(),
            commit_lock: Mutex::new(()),
            clock,
        })
    }

    // --- Write Operations ---

    /// Begin a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Run `f` as a unit of work.
    ///
    /// Changes recorded by `f` commit only if it returns `Ok`; on `Err` they
    /// are rolled back and the error is returned unchanged. The entity write
    /// performed by `f` and its change-log entries succeed or fail together.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<(T, Vec<ChangeLogEntry>), E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<T, E>,
        E: From<SyncError>,
    {
        let mut txn = self.begin();
        let value = f(&mut txn)?;
        let entries = txn.commit()?;
        Ok((value, entries))
    }

    /// Record a single change in its own transaction.
    pub fn record_change(
        &self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        op_type: OpType,
        payload_hash: Option<PayloadHash>,
    ) -> Result<ChangeLogEntry> {
        let mut txn = self.begin();
        txn.record_change(entity_type, entity_id, op_type, payload_hash)?;
        txn.commit()?
            .pop()
            .ok_or_else(|| SyncError::Transaction("commit produced no entry".into()))
    }

    /// Assign ids and timestamps to staged changes and append them as one
    /// frame. Called with the staged keys' version locks held.
    pub(crate) fn commit_staged(&self, staged: Vec<StagedChange>) -> Result<Vec<ChangeLogEntry>> {
        let _commit = self.commit_lock.lock();

        let (mut next_id, created_at) = {
            let index = self.index.read();
            (index.next_id(), self.clock.now().max(index.last_created_at()))
        };

        let entries: Vec<ChangeLogEntry> = staged
            .into_iter()
            .map(|change| {
                let id = next_id;
                next_id = EntryId(next_id.0 + 1);
                ChangeLogEntry {
                    id,
                    entity_type: change.entity_type,
                    entity_id: change.entity_id,
                    op_type: change.op_type,
                    version: change.version,
                    payload_hash: change.payload_hash,
                    created_at,
                }
            })
            .collect();

        self.log
            .append(&LogFrame::Commit(entries.clone()))
            .map_err(|e| SyncError::Transaction(format!("change log append failed: {}", e)))?;

        let mut index = self.index.write();
        for entry in &entries {
            index.insert(entry.clone());
        }
        drop(index);

        tracing::debug!(
            entries = entries.len(),
            first_id = entries.first().map(|e| e.id.0),
            created_at = created_at.0,
            "committed change-log transaction"
        );

        Ok(entries)
    }

    // --- Read Operations ---

    /// Get an entry by id.
    pub fn get_entry(&self, id: EntryId) -> Option<ChangeLogEntry> {
        self.index.read().get(id).cloned()
    }

    /// Latest committed version of an entity (0 if never written).
    pub fn current_version(&self, entity_type: EntityType, entity_id: Option<&str>) -> Version {
        self.current_version_of(&EntityKey::new(entity_type, entity_id))
    }

    pub(crate) fn current_version_of(&self, key: &EntityKey) -> Version {
        self.index.read().current_version(key)
    }

    /// Retained history of one entity, in version order.
    pub fn entity_history(&self, entity_type: EntityType, entity_id: Option<&str>) -> Vec<ChangeLogEntry> {
        self.index
            .read()
            .history(&EntityKey::new(entity_type, entity_id))
    }

    /// Read up to `take` entries after `start`.
    ///
    /// Returns `None` when `start` names an entry that is no longer retained.
    pub fn read_feed(
        &self,
        start: FeedStart,
        types: Option<&HashSet<EntityType>>,
        take: usize,
    ) -> Option<Vec<ChangeLogEntry>> {
        let index = self.index.read();
        let after = index.lower_bound(start)?;
        Some(index.scan(after, types, take))
    }

    // --- Maintenance ---

    /// Delete every entry created strictly before `cutoff`.
    ///
    /// Rewrites the log with the counter checkpoint followed by the surviving
    /// entries. A no-op when nothing is old enough.
    pub fn prune_before(&self, cutoff: Timestamp) -> Result<u64> {
        let _commit = self.commit_lock.lock();

        let frames = {
            let index = self.index.read();
            if index.count_before(cutoff) == 0 {
                return Ok(0);
            }

            let survivors: Vec<ChangeLogEntry> = index.entries_from(cutoff).cloned().collect();
            let mut frames = vec![index.checkpoint_frame()];
            frames.extend(
                survivors
                    .chunks(COMPACTION_CHUNK)
                    .map(|chunk| LogFrame::Commit(chunk.to_vec())),
            );
            frames
        };

        self.log
            .rewrite(&frames)
            .map_err(|e| SyncError::Prune(format!("log rewrite failed: {}", e)))?;

        let deleted = self.index.write().prune_before(cutoff);
        Ok(deleted as u64)
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            entry_count: index.len() as u64,
            tracked_keys: index.tracked_keys() as u64,
            oldest: index.oldest(),
            newest: index.newest(),
            log_size_bytes: self.log.size(),
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn key_locks(&self) -> &KeyLocks {
        &self.key_locks
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::NotInitialized,
            _ => SyncError::Io(e),
        })?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for ChangeStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = ChangeStore::open_or_create(test_config(&dir)).unwrap();
        assert!(store.path().join("MANIFEST").exists());
        assert_eq!(store.stats().entry_count, 0);
    }

    #[test]
    fn test_record_change_assigns_ids_and_versions() {
        let dir = TempDir::new().unwrap();
        let store = ChangeStore::open_or_create(test_config(&dir)).unwrap();

        let a = store
            .record_change(EntityType::Outing, Some("o1"), OpType::Create, None)
            .unwrap();
        let b = store
            .record_change(EntityType::Outing, Some("o1"), OpType::Update, None)
            .unwrap();
        let c = store
            .record_change(EntityType::Outing, Some("o2"), OpType::Create, None)
            .unwrap();

        assert_eq!((a.id, a.version), (EntryId(1), Version(1)));
        assert_eq!((b.id, b.version), (EntryId(2), Version(2)));
        assert_eq!((c.id, c.version), (EntryId(3), Version(1)));
        assert_eq!(store.get_entry(EntryId(2)), Some(b));
    }

    #[test]
    fn test_created_at_never_goes_backwards() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp(5_000)));
        let store =
            ChangeStore::open_or_create_with_clock(test_config(&dir), clock.clone()).unwrap();

        let first = store
            .record_change(EntityType::Place, Some("p1"), OpType::Create, None)
            .unwrap();
        clock.set(Timestamp(1_000));
        let second = store
            .record_change(EntityType::Place, Some("p2"), OpType::Create, None)
            .unwrap();

        assert_eq!(first.created_at, Timestamp(5_000));
        assert_eq!(second.created_at, Timestamp(5_000));
        assert!(second.position() > first.position());
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();

        {
            let store = ChangeStore::open_or_create(test_config(&dir)).unwrap();
            for _ in 0..3 {
                store
                    .record_change(EntityType::Signup, Some("s1"), OpType::Update, None)
                    .unwrap();
            }
        }

        let store = ChangeStore::open_or_create(test_config(&dir)).unwrap();
        assert_eq!(store.stats().entry_count, 3);
        assert_eq!(store.current_version(EntityType::Signup, Some("s1")), Version(3));

        let next = store
            .record_change(EntityType::Signup, Some("s1"), OpType::Delete, None)
            .unwrap();
        assert_eq!(next.id, EntryId(4));
        assert_eq!(next.version, Version(4));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let _store = ChangeStore::open_or_create(test_config(&dir)).unwrap();

        let second = ChangeStore::open_or_create(test_config(&dir));
        assert!(matches!(second, Err(SyncError::Locked)));
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            ChangeStore::open_or_create(config),
            Err(SyncError::NotInitialized)
        ));
    }

    #[test]
    fn test_prune_persists_checkpoint() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));

        {
            let store =
                ChangeStore::open_or_create_with_clock(test_config(&dir), clock.clone()).unwrap();
            store
                .record_change(EntityType::Outing, Some("o1"), OpType::Create, None)
                .unwrap();
            store
                .record_change(EntityType::Outing, Some("o1"), OpType::Update, None)
                .unwrap();
            clock.set(Timestamp(10_000));
            assert_eq!(store.prune_before(Timestamp(5_000)).unwrap(), 2);
            assert_eq!(store.prune_before(Timestamp(5_000)).unwrap(), 0);
        }

        let store =
            ChangeStore::open_or_create_with_clock(test_config(&dir), clock.clone()).unwrap();
        assert_eq!(store.stats().entry_count, 0);

        let next = store
            .record_change(EntityType::Outing, Some("o1"), OpType::Delete, None)
            .unwrap();
        assert_eq!(next.version, Version(3));
        assert_eq!(next.id, EntryId(3));
    }
}
