//! Entity mutation hook.
//!
//! Write paths on syncable entities call into this module after their own row
//! exists but before committing, so the change-log entry lands in the same
//! transaction as the mutation.

use crate::error::{Result, SyncError};
use crate::recorder::{StagedChange, Transaction};
use crate::types::{EntityType, OpType, PayloadHash};
use serde::Serialize;
use serde_json::{Map, Value};

/// Hash `fields` of `entity`.
///
/// Field order does not matter and duplicates are ignored. A field that is
/// missing hashes the same as one that is explicitly `null`. Nested objects are
/// canonicalized by key so the digest is independent of map iteration order.
pub fn compute_payload_hash(entity: &Value, fields: &[&str]) -> PayloadHash {
    let mut names: Vec<&str> = fields.to_vec();
    names.sort_unstable();
    names.dedup();

    let pairs: Vec<(&str, Value)> = names
        .into_iter()
        .map(|name| {
            let value = entity.get(name).map(canonicalize).unwrap_or(Value::Null);
            (name, value)
        })
        .collect();

    // Serializing an in-memory Value of strings and Values cannot fail.
    let bytes = serde_json::to_vec(&pairs).unwrap_or_default();
    PayloadHash::from_bytes(&bytes)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Sync-relevant fields per entity type.
///
/// Only fields a client renders or acts on are listed, so bookkeeping columns
/// (audit stamps, internal flags) do not produce spurious changes.
pub fn hash_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Outing => &[
            "name",
            "description",
            "start_date",
            "end_date",
            "place_id",
            "capacity",
            "signup_deadline",
            "status",
        ],
        EntityType::Signup => &["outing_id", "participant_id", "status", "notes"],
        EntityType::Participant => &[
            "first_name",
            "last_name",
            "family_member_id",
            "role",
            "rank_id",
        ],
        EntityType::Place => &["name", "address", "latitude", "longitude"],
        EntityType::FamilyMember => &["first_name", "last_name", "relationship", "user_id"],
        EntityType::Organization => &["name", "unit_type", "unit_number"],
        EntityType::MeritBadge => &["name", "description", "eagle_required"],
        EntityType::Rank => &["name", "sort_order"],
        EntityType::User => &["email", "display_name", "role"],
    }
}

/// A domain entity whose mutations feed the change log.
pub trait Syncable: Serialize {
    const ENTITY_TYPE: EntityType;

    /// Primary key once the row exists.
    fn entity_id(&self) -> Option<String>;

    /// Digest over [`hash_fields`] for this type.
    fn payload_hash(&self) -> Result<PayloadHash> {
        let value = serde_json::to_value(self)?;
        Ok(compute_payload_hash(&value, hash_fields(Self::ENTITY_TYPE)))
    }
}

/// Helpers that record the right op and hash for an entity mutation.
pub struct MutationHook;

impl MutationHook {
    pub fn created<E: Syncable>(txn: &mut Transaction<'_>, entity: &E) -> Result<StagedChange> {
        Self::record(txn, entity, OpType::Create)
    }

    pub fn updated<E: Syncable>(txn: &mut Transaction<'_>, entity: &E) -> Result<StagedChange> {
        Self::record(txn, entity, OpType::Update)
    }

    /// Deletes carry no payload hash.
    pub fn deleted<E: Syncable>(txn: &mut Transaction<'_>, entity: &E) -> Result<StagedChange> {
        let id = Self::require_id(entity, OpType::Delete)?;
        txn.record_change(E::ENTITY_TYPE, Some(&id), OpType::Delete, None)
    }

    /// Global event for a type, such as a bulk import, with no entity id.
    pub fn bulk_changed(
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
    ) -> Result<StagedChange> {
        txn.record_change(entity_type, None, OpType::Update, None)
    }

    fn record<E: Syncable>(
        txn: &mut Transaction<'_>,
        entity: &E,
        op_type: OpType,
    ) -> Result<StagedChange> {
        let id = Self::require_id(entity, op_type)?;
        let hash = entity.payload_hash()?;
        txn.record_change(E::ENTITY_TYPE, Some(&id), op_type, Some(hash))
    }

    fn require_id<E: Syncable>(entity: &E, op_type: OpType) -> Result<String> {
        entity.entity_id().ok_or_else(|| {
            SyncError::Transaction(format!(
                "{} of {} before its row was flushed (no entity id)",
                op_type,
                E::ENTITY_TYPE
            ))
        })
    }
}
