//! In-memory feed index over committed entries.

use super::log::LogFrame;
use crate::types::{ChangeLogEntry, EntityKey, EntityType, EntryId, Timestamp, Version};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

/// Where a feed scan starts. Both variants are exclusive lower bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedStart {
    /// Strictly after the entry with this id.
    AfterEntry(EntryId),
    /// Entries with `created_at` strictly after this time.
    AfterTime(Timestamp),
}

/// Entries ordered by `(created_at, id)`, plus the per-key counter table.
#[derive(Debug, Default)]
pub struct ChangeIndex {
    /// Feed order: (created_at, id) -> entry.
    ordered: BTreeMap<(Timestamp, EntryId), ChangeLogEntry>,

    /// Entry id -> created_at, for cursor resolution.
    positions: HashMap<EntryId, Timestamp>,

    /// Highest version ever committed per key. Survives pruning.
    counters: HashMap<EntityKey, Version>,

    /// Highest id ever assigned.
    max_id: u64,

    /// Latest commit time ever assigned.
    last_created_at: Timestamp,
}

impl ChangeIndex {
    pub fn new() -> Self {
        Self {
            last_created_at: Timestamp::MIN,
            ..Default::default()
        }
    }

    /// Rebuild from frames recovered from the log.
    pub fn from_frames(frames: Vec<LogFrame>) -> Self {
        let mut index = Self::new();
        for frame in frames {
            index.apply_frame(frame);
        }
        index
    }

    pub fn apply_frame(&mut self, frame: LogFrame) {
        match frame {
            LogFrame::Commit(entries) => {
                for entry in entries {
                    self.insert(entry);
                }
            }
            LogFrame::Checkpoint {
                counters,
                max_id,
                last_created_at,
            } => {
                for (key, version) in counters {
                    let slot = self.counters.entry(key).or_default();
                    *slot = (*slot).max(version);
                }
                self.max_id = self.max_id.max(max_id.0);
                self.last_created_at = self.last_created_at.max(last_created_at);
            }
        }
    }

    /// Add a committed entry.
    pub fn insert(&mut self, entry: ChangeLogEntry) {
        let slot = self.counters.entry(entry.key()).or_default();
        *slot = (*slot).max(entry.version);

        self.max_id = self.max_id.max(entry.id.0);
        self.last_created_at = self.last_created_at.max(entry.created_at);
        self.positions.insert(entry.id, entry.created_at);
        self.ordered.insert(entry.position(), entry);
    }

    /// Next id to hand out.
    pub fn next_id(&self) -> EntryId {
        EntryId(self.max_id + 1)
    }

    pub fn last_created_at(&self) -> Timestamp {
        self.last_created_at
    }

    /// Latest committed version for a key (0 if never written).
    pub fn current_version(&self, key: &EntityKey) -> Version {
        self.counters.get(key).copied().unwrap_or_default()
    }

    pub fn get(&self, id: EntryId) -> Option<&ChangeLogEntry> {
        let created_at = self.positions.get(&id)?;
        self.ordered.get(&(*created_at, id))
    }

    /// Resolve a scan start to an exclusive keyset bound. `None` when the
    /// referenced entry is not (or no longer) in the index.
    pub fn lower_bound(&self, start: FeedStart) -> Option<(Timestamp, EntryId)> {
        match start {
            FeedStart::AfterEntry(id) => self.positions.get(&id).map(|ts| (*ts, id)),
            FeedStart::AfterTime(ts) => Some((ts, EntryId(u64::MAX))),
        }
    }

    /// Up to `take` entries strictly after `after`, in feed order, restricted
    /// to `types` when given.
    pub fn scan(
        &self,
        after: (Timestamp, EntryId),
        types: Option<&HashSet<EntityType>>,
        take: usize,
    ) -> Vec<ChangeLogEntry> {
        self.ordered
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, entry)| entry)
            .filter(|entry| types.map_or(true, |t| t.contains(&entry.entity_type)))
            .take(take)
            .cloned()
            .collect()
    }

    /// Retained entries for one key, in version order.
    pub fn history(&self, key: &EntityKey) -> Vec<ChangeLogEntry> {
        let mut entries: Vec<_> = self
            .ordered
            .values()
            .filter(|e| e.entity_type == key.entity_type && e.entity_id == key.entity_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.version);
        entries
    }

    /// Number of entries created strictly before `cutoff`.
    pub fn count_before(&self, cutoff: Timestamp) -> usize {
        self.ordered
            .range(..(cutoff, EntryId(0)))
            .count()
    }

    /// Entries at or after `cutoff`, in feed order.
    pub fn entries_from(&self, cutoff: Timestamp) -> impl Iterator<Item = &ChangeLogEntry> {
        self.ordered
            .range((cutoff, EntryId(0))..)
            .map(|(_, entry)| entry)
    }

    /// Drop every entry created strictly before `cutoff`. Counters are kept.
    pub fn prune_before(&mut self, cutoff: Timestamp) -> usize {
        let kept = self.ordered.split_off(&(cutoff, EntryId(0)));
        let removed = std::mem::replace(&mut self.ordered, kept);
        for (_, id) in removed.keys() {
            self.positions.remove(id);
        }
        removed.len()
    }

    /// Counter table and high-water marks as a log frame.
    pub fn checkpoint_frame(&self) -> LogFrame {
        let mut counters: Vec<_> = self
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counters.sort();
        LogFrame::Checkpoint {
            counters,
            max_id: EntryId(self.max_id),
            last_created_at: self.last_created_at,
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.ordered.keys().next().map(|(ts, _)| *ts)
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.ordered.keys().next_back().map(|(ts, _)| *ts)
    }
}
