//! Core types for the change log.

use crate::error::{Result, SyncError};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a change-log entry.
///
/// Assigned by the store at commit time, strictly increasing in commit order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.parse::<u64>() {
            Ok(0) | Err(_) => Err(SyncError::MalformedCursor(s.to_string())),
            Ok(id) => Ok(EntryId(id)),
        }
    }
}

/// Per-entity version number. The first mutation of an entity is version 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub u64);

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Version {
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Parse an ISO-8601 / RFC 3339 timestamp.
    pub fn parse_rfc3339(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|_| SyncError::InvalidTimestamp(s.to_string()))
    }

    pub fn to_rfc3339(self) -> String {
        self.to_datetime()
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    pub fn saturating_sub(self, d: std::time::Duration) -> Self {
        let micros = i64::try_from(d.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(micros))
    }

    pub fn saturating_add(self, d: std::time::Duration) -> Self {
        let micros = i64::try_from(d.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Domain entity kinds tracked by the change log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Outing,
    Signup,
    Participant,
    Place,
    FamilyMember,
    Organization,
    MeritBadge,
    Rank,
    User,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        EntityType::Outing,
        EntityType::Signup,
        EntityType::Participant,
        EntityType::Place,
        EntityType::FamilyMember,
        EntityType::Organization,
        EntityType::MeritBadge,
        EntityType::Rank,
        EntityType::User,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Outing => "outing",
            EntityType::Signup => "signup",
            EntityType::Participant => "participant",
            EntityType::Place => "place",
            EntityType::FamilyMember => "family_member",
            EntityType::Organization => "organization",
            EntityType::MeritBadge => "merit_badge",
            EntityType::Rank => "rank",
            EntityType::User => "user",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::UnknownEntityType(s.to_string()))
    }
}

/// Kind of mutation a change-log entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Create,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OpType::Create),
            "update" => Ok(OpType::Update),
            "delete" => Ok(OpType::Delete),
            other => Err(SyncError::InvalidOperationType(other.to_string())),
        }
    }
}

/// Content digest (SHA-256) over a curated subset of an entity's fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHash(pub [u8; 32]);

impl PayloadHash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        PayloadHash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(PayloadHash(arr))
    }
}

impl fmt::Debug for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadHash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The (entity_type, entity_id) pair versions are counted against.
///
/// A `None` entity id is a global, non-entity event such as a bulk import.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: Option<&str>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.map(str::to_string),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(id) => write!(f, "{}/{}", self.entity_type, id),
            None => write!(f, "{}/*", self.entity_type),
        }
    }
}

/// A single committed mutation event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Unique identifier (assigned at commit).
    pub id: EntryId,

    pub entity_type: EntityType,

    /// Affected entity, or `None` for global events.
    pub entity_id: Option<String>,

    pub op_type: OpType,

    /// Position in this entity's history, starting at 1.
    pub version: Version,

    /// Digest over the entity's sync-relevant fields. Absent for deletes.
    pub payload_hash: Option<PayloadHash>,

    /// Commit time. Non-decreasing in id order.
    pub created_at: Timestamp,
}

impl ChangeLogEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
        }
    }

    /// Keyset position of this entry in the feed.
    pub fn position(&self) -> (Timestamp, EntryId) {
        (self.created_at, self.id)
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub entry_count: u64,
    pub tracked_keys: u64,
    pub oldest: Option<Timestamp>,
    pub newest: Option<Timestamp>,
    pub log_size_bytes: u64,
}
