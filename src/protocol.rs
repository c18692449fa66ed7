//! Client-side sync session.
//!
//! A client is either in sync, paging forward through the feed, or needs a
//! full resync from a bulk snapshot. Any invalid cursor or failed request
//! drops it to `ResetRequired`; only adopting a snapshot brings it back.

use crate::delta::{DeltaPage, DeltaQuery, DEFAULT_LIMIT};
use crate::types::{ChangeLogEntry, EntityKey, EntryId, Timestamp, Version};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    InSync,
    ResetRequired,
}

/// Baseline delivered with a bulk snapshot.
#[derive(Clone, Debug, Default)]
pub struct SyncBaseline {
    /// Feed position the snapshot was taken at, if known.
    pub cursor: Option<EntryId>,

    /// Snapshot time; used as `since` when no cursor is known.
    pub as_of: Timestamp,

    /// Entity versions contained in the snapshot.
    pub versions: HashMap<EntityKey, Version>,
}

/// Tracks a single client's position in the feed.
#[derive(Debug)]
pub struct SyncSession {
    state: SyncState,
    cursor: Option<EntryId>,
    since: Option<Timestamp>,
    applied: HashMap<EntityKey, Version>,
    page_limit: usize,
}

impl SyncSession {
    /// A fresh client has no baseline and must start from a snapshot.
    pub fn new() -> Self {
        Self {
            state: SyncState::ResetRequired,
            cursor: None,
            since: None,
            applied: HashMap::new(),
            page_limit: DEFAULT_LIMIT,
        }
    }

    pub fn from_baseline(baseline: SyncBaseline) -> Self {
        let mut session = Self::new();
        session.adopt_snapshot(baseline);
        session
    }

    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_in_sync(&self) -> bool {
        self.state == SyncState::InSync
    }

    pub fn cursor(&self) -> Option<EntryId> {
        self.cursor
    }

    /// Version of `key` the client currently holds.
    pub fn applied_version(&self, key: &EntityKey) -> Version {
        self.applied.get(key).copied().unwrap_or_default()
    }

    /// Next request to send, or `None` while a resync is required.
    pub fn next_query(&self) -> Option<DeltaQuery> {
        if self.state == SyncState::ResetRequired {
            return None;
        }

        Some(DeltaQuery {
            cursor: self.cursor,
            since: if self.cursor.is_none() { self.since } else { None },
            limit: self.page_limit,
            entity_types: None,
        })
    }

    /// Consume a page. Returns the entries the client has not already applied,
    /// in feed order.
    pub fn apply_page(&mut self, page: &DeltaPage) -> Vec<ChangeLogEntry> {
        if self.state == SyncState::ResetRequired {
            return Vec::new();
        }

        if page.cursor_invalid {
            tracing::warn!(cursor = ?self.cursor, "feed cursor invalid; full resync required");
            self.state = SyncState::ResetRequired;
            return Vec::new();
        }

        let mut fresh = Vec::new();
        for entry in &page.items {
            let key = entry.key();
            if entry.version > self.applied_version(&key) {
                self.applied.insert(key, entry.version);
                fresh.push(entry.clone());
            }
        }

        // Position moves only from delivered items. An empty page carries
        // server time, which can be ahead of a commit still in flight.
        if let Some(last) = page.items.last() {
            self.cursor = Some(last.id);
            self.since = Some(last.created_at);
        }

        fresh
    }

    /// A request failed; the client can no longer trust its position.
    pub fn record_error(&mut self) {
        self.state = SyncState::ResetRequired;
    }

    /// Replace local state with a bulk snapshot and resume from its baseline.
    pub fn adopt_snapshot(&mut self, baseline: SyncBaseline) {
        self.cursor = baseline.cursor;
        self.since = Some(baseline.as_of);
        self.applied = baseline.versions;
        self.state = SyncState::InSync;
    }
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}
