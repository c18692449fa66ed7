//! Transactional change recording.
//!
//! A [`Transaction`] stages change-log entries alongside an entity mutation.
//! Versions are assigned while holding a per-(entity_type, entity_id) lock,
//! taken before the current version is read and held until the transaction
//! commits or rolls back. Two writers on the same entity therefore serialize,
//! and a rolled-back transaction never leaves a version gap.
//!
//! Ids and timestamps are assigned at commit under the store's commit lock, so
//! the `(created_at, id)` feed order is commit order.

use crate::error::{Result, SyncError};
use crate::store::ChangeStore;
use crate::types::{ChangeLogEntry, EntityKey, EntityType, OpType, PayloadHash, Version};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Set of entity keys currently owned by open transactions.
#[derive(Default)]
pub(crate) struct KeyLocks {
    held: Mutex<HashSet<EntityKey>>,
    released: Condvar,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free, then take it.
    pub(crate) fn acquire(&self, key: &EntityKey, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();

        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                return Err(SyncError::Transaction(format!(
                    "timed out after {:?} waiting for version lock on {}",
                    timeout, key
                )));
            }
        }

        held.insert(key.clone());
        Ok(())
    }

    pub(crate) fn release<'k>(&self, keys: impl IntoIterator<Item = &'k EntityKey>) {
        let mut held = self.held.lock();
        for key in keys {
            held.remove(key);
        }
        drop(held);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn is_held(&self, key: &EntityKey) -> bool {
        self.held.lock().contains(key)
    }
}

/// A change recorded in an open transaction, not yet visible to readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedChange {
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub op_type: OpType,
    pub version: Version,
    pub payload_hash: Option<PayloadHash>,
}

impl StagedChange {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Unit of work that records changes atomically.
///
/// Dropping a transaction without calling [`Transaction::commit`] rolls it
/// back. After any error from [`Transaction::record_change`] the transaction
/// is aborted and `commit` fails.
///
/// Each key's version lock is taken on its first `record_change` and held to
/// the end, so transactions touching several entities must record them in a
/// consistent order (for example parent before child, then by id). Two
/// transactions locking the same keys in opposite orders block each other
/// until `lock_timeout` aborts at least one of them.
pub struct Transaction<'a> {
    store: &'a ChangeStore,
    staged: Vec<StagedChange>,
    held: HashSet<EntityKey>,
    pending_versions: HashMap<EntityKey, Version>,
    aborted: Option<String>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a ChangeStore) -> Self {
        Self {
            store,
            staged: Vec::new(),
            held: HashSet::new(),
            pending_versions: HashMap::new(),
            aborted: None,
            finished: false,
        }
    }

    /// Record one mutation of `(entity_type, entity_id)`.
    ///
    /// The version is `max(committed version) + 1`, counting changes already
    /// staged for the same key in this transaction.
    pub fn record_change(
        &mut self,
        entity_type: EntityType,
        entity_id: Option<&str>,
        op_type: OpType,
        payload_hash: Option<PayloadHash>,
    ) -> Result<StagedChange> {
        if let Some(reason) = &self.aborted {
            return Err(SyncError::Transaction(format!(
                "transaction already aborted: {}",
                reason
            )));
        }

        let key = EntityKey::new(entity_type, entity_id);

        if !self.held.contains(&key) {
            if let Err(e) = self.store.key_locks().acquire(&key, self.store.lock_timeout()) {
                self.aborted = Some(e.to_string());
                return Err(e);
            }
            self.held.insert(key.clone());
        }

        let version = match self.pending_versions.get(&key) {
            Some(v) => v.next(),
            None => self.store.current_version_of(&key).next(),
        };
        self.pending_versions.insert(key.clone(), version);

        let staged = StagedChange {
            entity_type,
            entity_id: key.entity_id,
            op_type,
            version,
            payload_hash,
        };

        tracing::trace!(
            entity_type = %staged.entity_type,
            entity_id = ?staged.entity_id,
            op = %staged.op_type,
            version = staged.version.0,
            "staged change"
        );

        self.staged.push(staged.clone());
        Ok(staged)
    }

    /// String-typed entry point for callers holding raw names.
    ///
    /// Fails with `InvalidOperationType` for anything other than `create`,
    /// `update` or `delete`, and `UnknownEntityType` for names outside the
    /// vocabulary.
    pub fn record_change_str(
        &mut self,
        entity_type: &str,
        entity_id: Option<&str>,
        op_type: &str,
        payload_hash: Option<PayloadHash>,
    ) -> Result<StagedChange> {
        let op_type: OpType = op_type.parse()?;
        let entity_type: EntityType = entity_type.parse()?;
        self.record_change(entity_type, entity_id, op_type, payload_hash)
    }

    /// Changes staged so far.
    pub fn staged(&self) -> &[StagedChange] {
        &self.staged
    }

    /// Make all staged changes durable and visible, in staging order.
    pub fn commit(mut self) -> Result<Vec<ChangeLogEntry>> {
        self.finished = true;

        if let Some(reason) = self.aborted.take() {
            return Err(SyncError::Transaction(format!(
                "cannot commit aborted transaction: {}",
                reason
            )));
        }

        if self.staged.is_empty() {
            return Ok(Vec::new());
        }

        let staged = std::mem::take(&mut self.staged);
        self.store.commit_staged(staged)
    }

    /// Discard all staged changes.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            tracing::debug!(staged = self.staged.len(), "rolling back change-log transaction");
        }
        self.store.key_locks().release(self.held.iter());
    }
}
