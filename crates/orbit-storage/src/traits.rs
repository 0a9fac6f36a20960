use async_trait::async_trait;
use serde_json::Value;

use crate::models::{
    AnchorSessionRecord, ArtifactRecord, ChallengeRecord, DeviceCodeRecord, NewArtifact,
    SessionRecord, ThreadMessage, ThreadState,
};

/// The durable half of the relay: thread state, the bounded message log,
/// the artifact index, and the auth collaborator's record store
/// (spec.md §4.2). All operations are idempotent unless documented
/// otherwise; none perform network I/O.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_thread_state(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> anyhow::Result<Option<ThreadState>>;

    /// Upsert; `anchor_id = None` clears the binding. `updated_at = now`.
    async fn set_thread_anchor(
        &self,
        user_id: &str,
        thread_id: &str,
        anchor_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Upsert; only the fields supplied are written, others keep their
    /// prior value (spec.md §4.6 "merge with existing state").
    async fn set_thread_turn(
        &self,
        user_id: &str,
        thread_id: &str,
        turn_id: Option<&str>,
        turn_status: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Appends `raw_frame`, then evicts all but the newest
    /// `retention` rows for `(user_id, thread_id)`. Also touches
    /// `thread_state.updated_at`.
    async fn append_thread_message(
        &self,
        user_id: &str,
        thread_id: &str,
        raw_frame: &Value,
        retention: usize,
    ) -> anyhow::Result<()>;

    /// Newest `min(limit, retention)` rows, returned oldest-first.
    async fn list_thread_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ThreadMessage>>;

    /// Unique on `(user_id, thread_id, item_id)`; retains at most
    /// `retention` rows per thread afterward.
    async fn upsert_artifact(&self, record: NewArtifact, retention: usize) -> anyhow::Result<()>;

    async fn list_artifacts(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        limit: usize,
        before_id: Option<i64>,
    ) -> anyhow::Result<Vec<ArtifactRecord>>;

    // --- auth collaborator (spec.md §1, §4.2) ---

    async fn create_device_code(
        &self,
        device_code: &str,
        user_code: &str,
        ttl_sec: i64,
    ) -> anyhow::Result<()>;

    /// Marks the device code authorised for `user_id`; `false` if it was
    /// not pending or has expired.
    async fn authorize_device_code(&self, user_code: &str, user_id: &str) -> anyhow::Result<bool>;

    /// Atomic consume-on-match: a single `DELETE ... RETURNING` so two
    /// concurrent pollers cannot both receive the record.
    async fn consume_device_code(
        &self,
        device_code: &str,
    ) -> anyhow::Result<Option<DeviceCodeRecord>>;

    async fn create_challenge(
        &self,
        challenge: &str,
        kind: &str,
        user_id: Option<&str>,
        pending_name: Option<&str>,
        pending_display_name: Option<&str>,
        ttl_sec: i64,
    ) -> anyhow::Result<()>;

    /// Atomic consume-on-match, scoped to `expected_kind`.
    async fn consume_challenge(
        &self,
        challenge: &str,
        expected_kind: &str,
    ) -> anyhow::Result<Option<ChallengeRecord>>;

    async fn create_session(
        &self,
        user_id: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<(SessionRecord, String)>;

    async fn get_active_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>>;

    async fn revoke_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Rotates a refresh token: revokes the old session and mints a new
    /// one for the same user. `None` if the refresh token is unknown,
    /// revoked, or expired.
    async fn rotate_refresh(
        &self,
        refresh_token: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<Option<(SessionRecord, String)>>;

    async fn create_anchor_session(
        &self,
        user_id: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<(AnchorSessionRecord, String, String)>;

    async fn get_active_anchor_session_by_access_token(
        &self,
        access_token: &str,
    ) -> anyhow::Result<Option<AnchorSessionRecord>>;

    async fn rotate_anchor_refresh(
        &self,
        refresh_token: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<Option<(AnchorSessionRecord, String, String)>>;
}
