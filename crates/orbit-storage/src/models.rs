use serde::Serialize;
use serde_json::Value;

/// `(user_id, thread_id) → {bound_anchor_id?, turn_id?, turn_status?, updated_at}`
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadState {
    pub bound_anchor_id: Option<String>,
    pub turn_id: Option<String>,
    pub turn_status: Option<String>,
    pub updated_at: i64,
}

/// One row of the bounded per-thread message log (spec.md §3).
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    pub id: i64,
    pub raw: Value,
    pub created_at: i64,
}

/// The fields accepted by `upsert_artifact`; `id` and `created_at` are
/// assigned by storage (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub user_id: String,
    pub thread_id: String,
    pub item_id: String,
    pub turn_id: Option<String>,
    pub anchor_id: Option<String>,
    pub artifact_type: String,
    pub item_type: String,
    pub summary: String,
    pub payload: Value,
}

/// A persisted artifact row, shaped for the wire per spec.md §4.5.1.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub id: i64,
    pub thread_id: String,
    pub turn_id: Option<String>,
    pub anchor_id: Option<String>,
    pub item_id: String,
    pub artifact_type: String,
    pub item_type: String,
    pub summary: String,
    pub payload: Value,
    pub created_at: i64,
}

/// A device-code row as handed back by the atomic consume operation
/// (spec.md §4.2, grounded on `original_source/.../db.py`).
#[derive(Debug, Clone)]
pub struct DeviceCodeRecord {
    pub device_code: String,
    pub user_code: String,
    pub status: String,
    pub user_id: Option<String>,
    pub expires_at: i64,
}

/// A challenge row as handed back by the atomic consume operation.
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub challenge: String,
    pub kind: String,
    pub user_id: Option<String>,
    pub pending_name: Option<String>,
    pub pending_display_name: Option<String>,
    pub expires_at: i64,
}

/// A web session record, keyed by session id (the JWT's `jti`).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub expires_at: i64,
    pub refresh_token_hash: String,
    pub refresh_expires_at: i64,
}

/// An anchor session record: an opaque bearer-token pair for `/ws/anchor`.
#[derive(Debug, Clone)]
pub struct AnchorSessionRecord {
    pub id: String,
    pub user_id: String,
    pub access_expires_at: i64,
    pub refresh_token_hash: String,
    pub refresh_expires_at: i64,
}
