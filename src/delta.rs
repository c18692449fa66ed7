//! Delta feed queries.
//!
//! Clients page through the change log in `(created_at, id)` order using
//! keyset pagination. A cursor is the id of the last entry a client received;
//! the next page holds entries strictly after it in that tuple order, so rows
//! sharing a timestamp are neither skipped nor repeated.

use crate::changelog::FeedStart;
use crate::error::Result;
use crate::store::ChangeStore;
use crate::types::{ChangeLogEntry, EntityType, EntryId, Timestamp};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Page size when the caller gives none.
pub const DEFAULT_LIMIT: usize = 200;

/// Largest page a caller may request.
pub const MAX_LIMIT: usize = 500;

/// Lookback for callers that supply neither cursor nor since.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

/// Clamp a requested page size into `[1, MAX_LIMIT]`.
pub fn clamp_limit(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_LIMIT,
        Some(n) if n < 1 => 1,
        Some(n) => usize::try_from(n).map_or(MAX_LIMIT, |n| n.min(MAX_LIMIT)),
    }
}

/// What the caller is allowed to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallerScope {
    /// May narrow the feed to any entity types.
    Privileged,
    /// Always served the policy's allow-list.
    Standard,
}

/// Server-side entity-type visibility rules.
#[derive(Clone, Debug)]
pub struct ScopePolicy {
    allow_list: HashSet<EntityType>,
}

impl ScopePolicy {
    pub fn new(allow_list: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            allow_list: allow_list.into_iter().collect(),
        }
    }

    pub fn allow_list(&self) -> &HashSet<EntityType> {
        &self.allow_list
    }

    /// Entity types a query may return. `None` means unrestricted.
    ///
    /// Standard callers get the allow-list no matter what they asked for;
    /// their requested types are ignored rather than rejected.
    pub fn effective_types(
        &self,
        scope: CallerScope,
        requested: Option<&[EntityType]>,
    ) -> Option<HashSet<EntityType>> {
        match scope {
            CallerScope::Privileged => requested.map(|types| types.iter().copied().collect()),
            CallerScope::Standard => Some(self.allow_list.clone()),
        }
    }
}

impl Default for ScopePolicy {
    fn default() -> Self {
        Self::new([
            EntityType::Outing,
            EntityType::Signup,
            EntityType::Participant,
            EntityType::Place,
        ])
    }
}

/// A feed request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeltaQuery {
    /// Resume after this entry. Takes precedence over `since`.
    pub cursor: Option<EntryId>,

    /// Entries created strictly after this time.
    pub since: Option<Timestamp>,

    /// Page size, already clamped.
    pub limit: usize,

    /// Requested entity types (honored for privileged callers only).
    pub entity_types: Option<Vec<EntityType>>,
}

impl DeltaQuery {
    /// Build a query from raw request parameters.
    ///
    /// A non-empty cursor that is not a valid id is `MalformedCursor`. An
    /// unparseable `since` is `InvalidTimestamp` unless a cursor is given.
    /// Unknown names in the comma-separated type list are dropped.
    pub fn from_params(
        cursor: Option<&str>,
        since: Option<&str>,
        limit: Option<i64>,
        entity_types: Option<&str>,
    ) -> Result<Self> {
        let cursor = match cursor.map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => Some(raw.parse::<EntryId>()?),
            None => None,
        };

        // `since` is ignored, not validated, once a cursor is present.
        let since = match since.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) if cursor.is_none() => Some(Timestamp::parse_rfc3339(raw)?),
            _ => None,
        };

        let entity_types = entity_types
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_type_list);

        Ok(Self {
            cursor,
            since,
            limit: clamp_limit(limit),
            entity_types,
        })
    }

    /// Resume after `cursor`.
    pub fn after(cursor: EntryId, limit: usize) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
            ..Default::default()
        }
    }

    /// Entries created after `since`.
    pub fn since(since: Timestamp, limit: usize) -> Self {
        Self {
            since: Some(since),
            limit,
            ..Default::default()
        }
    }

    pub fn with_entity_types(mut self, types: Vec<EntityType>) -> Self {
        self.entity_types = Some(types);
        self
    }
}

fn parse_type_list(raw: &str) -> Vec<EntityType> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match name.parse::<EntityType>() {
            Ok(t) => Some(t),
            Err(_) => {
                tracing::debug!(entity_type = name, "dropping unknown entity type from filter");
                None
            }
        })
        .collect()
}

/// One page of the feed.
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaPage {
    pub items: Vec<ChangeLogEntry>,

    /// More entries exist after the last item.
    pub has_more: bool,

    /// Id of the last returned item when `has_more` is set.
    pub next_cursor: Option<EntryId>,

    /// `created_at` of the last returned item, or server time for an empty
    /// page.
    pub latest_timestamp: Timestamp,

    /// The cursor no longer resolves (typically pruned). The client must fall
    /// back to a full resync.
    pub cursor_invalid: bool,
}

/// Serves permission-scoped pages of the change log.
pub struct DeltaQueryService {
    store: Arc<ChangeStore>,
    policy: ScopePolicy,
    default_lookback: Duration,
}

impl DeltaQueryService {
    pub fn new(store: Arc<ChangeStore>, policy: ScopePolicy) -> Self {
        Self {
            store,
            policy,
            default_lookback: DEFAULT_LOOKBACK,
        }
    }

    pub fn with_default_lookback(mut self, lookback: Duration) -> Self {
        self.default_lookback = lookback;
        self
    }

    pub fn policy(&self) -> &ScopePolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        &self.store
    }

    /// Fetch the page described by `query` for a caller with `scope`.
    pub fn get_deltas(&self, query: &DeltaQuery, scope: CallerScope) -> DeltaPage {
        let limit = query.limit.clamp(1, MAX_LIMIT);
        let types = self
            .policy
            .effective_types(scope, query.entity_types.as_deref());

        let start = match (query.cursor, query.since) {
            (Some(cursor), _) => FeedStart::AfterEntry(cursor),
            (None, Some(since)) => FeedStart::AfterTime(since),
            (None, None) => {
                FeedStart::AfterTime(self.store.now().saturating_sub(self.default_lookback))
            }
        };

        let Some(mut items) = self.store.read_feed(start, types.as_ref(), limit + 1) else {
            tracing::info!(
                cursor = ?query.cursor,
                "cursor no longer resolves; client must resync"
            );
            return DeltaPage {
                items: Vec::new(),
                has_more: false,
                next_cursor: None,
                latest_timestamp: self.store.now(),
                cursor_invalid: true,
            };
        };

        let has_more = items.len() > limit;
        items.truncate(limit);

        let last = items.last();
        let next_cursor = if has_more { last.map(|e| e.id) } else { None };
        let latest_timestamp = last
            .map(|e| e.created_at)
            .unwrap_or_else(|| self.store.now());

        tracing::debug!(
            ?start,
            ?scope,
            returned = items.len(),
            has_more,
            "served delta page"
        );

        DeltaPage {
            items,
            has_more,
            next_cursor,
            latest_timestamp,
            cursor_invalid: false,
        }
    }

    /// Parse raw parameters and fetch the page.
    pub fn get_deltas_raw(
        &self,
        cursor: Option<&str>,
        since: Option<&str>,
        limit: Option<i64>,
        entity_types: Option<&str>,
        scope: CallerScope,
    ) -> Result<DeltaPage> {
        let query = DeltaQuery::from_params(cursor, since, limit, entity_types)?;
        Ok(self.get_deltas(&query, scope))
    }
}
