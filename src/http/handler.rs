use super::error::ApiError;
use super::AppState;
use crate::delta::DeltaPage;
use crate::error::SyncError;
use crate::types::ChangeLogEntry;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::num::IntErrorKind;

// --- Request / Response DTOs ---

/// Query string of `GET /deltas`. Everything is optional and parsed by hand so
/// malformed values produce a validation error rather than a rejection.
#[derive(Debug, Default, Deserialize)]
pub struct DeltasParams {
    pub since: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<String>,
    pub entity_types: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DeltaEntryResponse {
    pub id: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub op_type: String,
    pub version: u64,
    pub payload_hash: Option<String>,
    pub created_at: String,
}

impl From<&ChangeLogEntry> for DeltaEntryResponse {
    fn from(entry: &ChangeLogEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            entity_type: entry.entity_type.to_string(),
            entity_id: entry.entity_id.clone(),
            op_type: entry.op_type.to_string(),
            version: entry.version.0,
            payload_hash: entry.payload_hash.map(|h| h.to_hex()),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct DeltasResponse {
    pub items: Vec<DeltaEntryResponse>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub latest_timestamp: String,
    pub cursor_invalid: bool,
}

impl From<DeltaPage> for DeltasResponse {
    fn from(page: DeltaPage) -> Self {
        Self {
            items: page.items.iter().map(DeltaEntryResponse::from).collect(),
            has_more: page.has_more,
            next_cursor: page.next_cursor.map(|c| c.to_string()),
            latest_timestamp: page.latest_timestamp.to_rfc3339(),
            cursor_invalid: page.cursor_invalid,
        }
    }
}

// --- Handlers ---

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn get_deltas(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DeltasParams>,
) -> Result<Json<DeltasResponse>, ApiError> {
    let scope = state.caller_resolver.resolve(&headers);
    let limit = parse_limit(params.limit.as_deref())?;

    let page = state.service.get_deltas_raw(
        params.cursor.as_deref(),
        params.since.as_deref(),
        limit,
        params.entity_types.as_deref(),
        scope,
    )?;

    Ok(Json(DeltasResponse::from(page)))
}

fn parse_limit(raw: Option<&str>) -> Result<Option<i64>, SyncError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        // Out-of-range integers are still integers; they clamp like any other.
        Some(s) => match s.parse::<i64>() {
            Ok(n) => Ok(Some(n)),
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => Ok(Some(i64::MAX)),
            Err(e) if *e.kind() == IntErrorKind::NegOverflow => Ok(Some(i64::MIN)),
            Err(_) => Err(SyncError::InvalidLimit(s.to_string())),
        },
    }
}
