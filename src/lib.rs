//! # Delta Sync
//!
//! A change-log engine that lets offline-capable clients pull only what
//! changed since their last sync.
//!
//! ## Core Concepts
//!
//! - **Change log**: one entry per create/update/delete of a syncable entity,
//!   recorded in the same transaction as the mutation
//! - **Versions**: per-entity counters that are contiguous from 1 and never
//!   reused, even after pruning
//! - **Delta feed**: keyset-paginated reads in `(created_at, id)` order,
//!   scoped by caller privilege
//! - **Retention**: entries older than the window are pruned; clients whose
//!   cursor was pruned fall back to a full resync
//!
//! ## Example
//!
//! ```ignore
//! use delta_sync::{ChangeStore, StoreConfig, DeltaQueryService, ScopePolicy, DeltaQuery, CallerScope};
//! use delta_sync::hook::MutationHook;
//!
//! let store = Arc::new(ChangeStore::open_or_create(StoreConfig {
//!     path: "./changelog".into(),
//!     ..Default::default()
//! })?);
//!
//! // Record an entity write alongside its change-log entry
//! store.transaction(|txn| {
//!     let outing = outings.insert(new_outing)?;
//!     MutationHook::created(txn, &outing)?;
//!     Ok::<_, SyncError>(outing)
//! })?;
//!
//! // Serve a page of the feed
//! let service = DeltaQueryService::new(store, ScopePolicy::default());
//! let page = service.get_deltas(&DeltaQuery::after(cursor, 200), CallerScope::Standard);
//! ```

pub mod changelog;
pub mod clock;
pub mod config;
pub mod delta;
pub mod error;
pub mod hook;
pub mod http;
pub mod protocol;
pub mod recorder;
pub mod retention;
pub mod store;
pub mod telemetry;
pub mod types;

// Re-exports
pub use changelog::{ChangeIndex, ChangeLogFile, FeedStart, LogFrame};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use delta::{CallerScope, DeltaPage, DeltaQuery, DeltaQueryService, ScopePolicy};
pub use error::{Result, SyncError};
pub use hook::{compute_payload_hash, hash_fields, MutationHook, Syncable};
pub use protocol::{SyncBaseline, SyncSession, SyncState};
pub use recorder::{StagedChange, Transaction};
pub use retention::{PruneReport, RetentionPruner, RetentionScheduler};
pub use store::{ChangeStore, StoreConfig};
pub use types::*;
