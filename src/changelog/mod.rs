//! Change-log storage.
//!
//! Committed entries live in an append-only file of checksummed frames and
//! are mirrored in an in-memory index ordered by `(created_at, id)` for
//! keyset pagination.

mod index;
mod log;

pub use index::{ChangeIndex, FeedStart};
pub use log::{ChangeLogFile, LogFrame};
