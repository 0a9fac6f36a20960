use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::models::{
    AnchorSessionRecord, ArtifactRecord, ChallengeRecord, DeviceCodeRecord, NewArtifact,
    SessionRecord, ThreadMessage, ThreadState,
};
use crate::traits::Storage;

fn now_sec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn random_token(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SQLite-backed implementation of [`Storage`].
///
/// Schema is created by `init()` rather than `sqlx::migrate!` — the gateway
/// opens ad-hoc databases (in tests, one per `127.0.0.1:0` server) rather
/// than a single migrated instance.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS thread_state (
                user_id        TEXT NOT NULL,
                thread_id      TEXT NOT NULL,
                bound_anchor_id TEXT,
                turn_id        TEXT,
                turn_status    TEXT,
                updated_at     INTEGER NOT NULL,
                PRIMARY KEY (user_id, thread_id)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS thread_messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    TEXT NOT NULL,
                thread_id  TEXT NOT NULL,
                raw        TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_thread_messages_scope
             ON thread_messages (user_id, thread_id, id)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS artifacts (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id       TEXT NOT NULL,
                thread_id     TEXT NOT NULL,
                item_id       TEXT NOT NULL,
                turn_id       TEXT,
                anchor_id     TEXT,
                artifact_type TEXT NOT NULL,
                item_type     TEXT NOT NULL,
                summary       TEXT NOT NULL,
                payload       TEXT NOT NULL,
                created_at    INTEGER NOT NULL,
                UNIQUE (user_id, thread_id, item_id)
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_artifacts_scope
             ON artifacts (user_id, thread_id, id)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS device_codes (
                device_code TEXT PRIMARY KEY,
                user_code   TEXT NOT NULL UNIQUE,
                status      TEXT NOT NULL,
                user_id     TEXT,
                expires_at  INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS challenges (
                challenge            TEXT PRIMARY KEY,
                kind                 TEXT NOT NULL,
                user_id              TEXT,
                pending_name         TEXT,
                pending_display_name TEXT,
                expires_at           INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id                  TEXT PRIMARY KEY,
                user_id             TEXT NOT NULL,
                expires_at          INTEGER NOT NULL,
                revoked_at          INTEGER,
                refresh_token_hash  TEXT NOT NULL,
                refresh_expires_at  INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_refresh_hash ON sessions (refresh_token_hash)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS anchor_sessions (
                id                  TEXT PRIMARY KEY,
                user_id             TEXT NOT NULL,
                access_token_hash   TEXT NOT NULL UNIQUE,
                access_expires_at   INTEGER NOT NULL,
                refresh_token_hash  TEXT NOT NULL UNIQUE,
                refresh_expires_at  INTEGER NOT NULL,
                revoked_at          INTEGER
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn evict_thread_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        retention: usize,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM thread_messages
             WHERE user_id = ? AND thread_id = ? AND id NOT IN (
                 SELECT id FROM thread_messages
                 WHERE user_id = ? AND thread_id = ?
                 ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(user_id)
        .bind(thread_id)
        .bind(retention as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evict_artifacts(
        &self,
        user_id: &str,
        thread_id: &str,
        retention: usize,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "DELETE FROM artifacts
             WHERE user_id = ? AND thread_id = ? AND id NOT IN (
                 SELECT id FROM artifacts
                 WHERE user_id = ? AND thread_id = ?
                 ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(user_id)
        .bind(thread_id)
        .bind(retention as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_thread_state(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> anyhow::Result<Option<ThreadState>> {
        let row = sqlx::query(
            "SELECT bound_anchor_id, turn_id, turn_status, updated_at
             FROM thread_state WHERE user_id = ? AND thread_id = ?",
        )
        .bind(user_id)
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ThreadState {
            bound_anchor_id: r.get("bound_anchor_id"),
            turn_id: r.get("turn_id"),
            turn_status: r.get("turn_status"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn set_thread_anchor(
        &self,
        user_id: &str,
        thread_id: &str,
        anchor_id: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO thread_state (user_id, thread_id, bound_anchor_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, thread_id) DO UPDATE SET
                bound_anchor_id = excluded.bound_anchor_id,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(anchor_id)
        .bind(now_sec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_thread_turn(
        &self,
        user_id: &str,
        thread_id: &str,
        turn_id: Option<&str>,
        turn_status: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO thread_state (user_id, thread_id, turn_id, turn_status, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (user_id, thread_id) DO UPDATE SET
                turn_id = COALESCE(excluded.turn_id, thread_state.turn_id),
                turn_status = COALESCE(excluded.turn_status, thread_state.turn_status),
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(turn_id)
        .bind(turn_status)
        .bind(now_sec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_thread_message(
        &self,
        user_id: &str,
        thread_id: &str,
        raw_frame: &Value,
        retention: usize,
    ) -> anyhow::Result<()> {
        let raw = serde_json::to_string(raw_frame)?;
        let now = now_sec();

        sqlx::query(
            "INSERT INTO thread_messages (user_id, thread_id, raw, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(raw)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO thread_state (user_id, thread_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (user_id, thread_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.evict_thread_messages(user_id, thread_id, retention)
            .await
    }

    async fn list_thread_messages(
        &self,
        user_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ThreadMessage>> {
        let rows = sqlx::query(
            "SELECT id, raw, created_at FROM (
                SELECT id, raw, created_at FROM thread_messages
                WHERE user_id = ? AND thread_id = ?
                ORDER BY id DESC LIMIT ?
             ) ORDER BY id ASC",
        )
        .bind(user_id)
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw: String = r.get("raw");
                Ok(ThreadMessage {
                    id: r.get("id"),
                    raw: serde_json::from_str(&raw)?,
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn upsert_artifact(&self, record: NewArtifact, retention: usize) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            "INSERT INTO artifacts
                (user_id, thread_id, item_id, turn_id, anchor_id, artifact_type, item_type, summary, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, thread_id, item_id) DO UPDATE SET
                turn_id = excluded.turn_id,
                anchor_id = excluded.anchor_id,
                artifact_type = excluded.artifact_type,
                item_type = excluded.item_type,
                summary = excluded.summary,
                payload = excluded.payload,
                created_at = excluded.created_at",
        )
        .bind(&record.user_id)
        .bind(&record.thread_id)
        .bind(&record.item_id)
        .bind(&record.turn_id)
        .bind(&record.anchor_id)
        .bind(&record.artifact_type)
        .bind(&record.item_type)
        .bind(&record.summary)
        .bind(payload)
        .bind(now_sec())
        .execute(&self.pool)
        .await?;

        self.evict_artifacts(&record.user_id, &record.thread_id, retention)
            .await
    }

    async fn list_artifacts(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        limit: usize,
        before_id: Option<i64>,
    ) -> anyhow::Result<Vec<ArtifactRecord>> {
        let rows = match (thread_id, before_id) {
            (Some(t), Some(before)) => {
                sqlx::query(
                    "SELECT id, thread_id, turn_id, anchor_id, item_id, artifact_type, item_type,
                            summary, payload, created_at
                     FROM artifacts WHERE user_id = ? AND thread_id = ? AND id < ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(t)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(t), None) => {
                sqlx::query(
                    "SELECT id, thread_id, turn_id, anchor_id, item_id, artifact_type, item_type,
                            summary, payload, created_at
                     FROM artifacts WHERE user_id = ? AND thread_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(t)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(before)) => {
                sqlx::query(
                    "SELECT id, thread_id, turn_id, anchor_id, item_id, artifact_type, item_type,
                            summary, payload, created_at
                     FROM artifacts WHERE user_id = ? AND id < ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(
                    "SELECT id, thread_id, turn_id, anchor_id, item_id, artifact_type, item_type,
                            summary, payload, created_at
                     FROM artifacts WHERE user_id = ?
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|r| {
                let payload: String = r.get("payload");
                let payload = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
                Ok(ArtifactRecord {
                    id: r.get("id"),
                    thread_id: r.get("thread_id"),
                    turn_id: r.get("turn_id"),
                    anchor_id: r.get("anchor_id"),
                    item_id: r.get("item_id"),
                    artifact_type: r.get("artifact_type"),
                    item_type: r.get("item_type"),
                    summary: r.get("summary"),
                    payload,
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn create_device_code(
        &self,
        device_code: &str,
        user_code: &str,
        ttl_sec: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO device_codes (device_code, user_code, status, user_id, expires_at)
             VALUES (?, ?, 'pending', NULL, ?)",
        )
        .bind(device_code)
        .bind(user_code)
        .bind(now_sec() + ttl_sec)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn authorize_device_code(&self, user_code: &str, user_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE device_codes SET status = 'authorised', user_id = ?
             WHERE user_code = ? AND status = 'pending' AND expires_at > ?",
        )
        .bind(user_id)
        .bind(user_code)
        .bind(now_sec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_device_code(
        &self,
        device_code: &str,
    ) -> anyhow::Result<Option<DeviceCodeRecord>> {
        let row = sqlx::query(
            "DELETE FROM device_codes
             WHERE device_code = ? AND status = 'authorised' AND expires_at > ?
             RETURNING device_code, user_code, status, user_id, expires_at",
        )
        .bind(device_code)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(r) = row {
            return Ok(Some(DeviceCodeRecord {
                device_code: r.get("device_code"),
                user_code: r.get("user_code"),
                status: r.get("status"),
                user_id: r.get("user_id"),
                expires_at: r.get("expires_at"),
            }));
        }

        sqlx::query("DELETE FROM device_codes WHERE device_code = ? AND expires_at <= ?")
            .bind(device_code)
            .bind(now_sec())
            .execute(&self.pool)
            .await?;
        Ok(None)
    }

    async fn create_challenge(
        &self,
        challenge: &str,
        kind: &str,
        user_id: Option<&str>,
        pending_name: Option<&str>,
        pending_display_name: Option<&str>,
        ttl_sec: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO challenges
                (challenge, kind, user_id, pending_name, pending_display_name, expires_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(challenge)
        .bind(kind)
        .bind(user_id)
        .bind(pending_name)
        .bind(pending_display_name)
        .bind(now_sec() + ttl_sec)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_challenge(
        &self,
        challenge: &str,
        expected_kind: &str,
    ) -> anyhow::Result<Option<ChallengeRecord>> {
        let row = sqlx::query(
            "DELETE FROM challenges WHERE challenge = ? AND kind = ? AND expires_at > ?
             RETURNING challenge, kind, user_id, pending_name, pending_display_name, expires_at",
        )
        .bind(challenge)
        .bind(expected_kind)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(r) = row {
            return Ok(Some(ChallengeRecord {
                challenge: r.get("challenge"),
                kind: r.get("kind"),
                user_id: r.get("user_id"),
                pending_name: r.get("pending_name"),
                pending_display_name: r.get("pending_display_name"),
                expires_at: r.get("expires_at"),
            }));
        }

        sqlx::query("DELETE FROM challenges WHERE challenge = ?")
            .bind(challenge)
            .execute(&self.pool)
            .await?;
        Ok(None)
    }

    async fn create_session(
        &self,
        user_id: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<(SessionRecord, String)> {
        let id = format!("{:032x}", rand_u128());
        let refresh_token = random_token(48);
        let refresh_hash = sha256_hex(&refresh_token);
        let now = now_sec();
        let expires_at = now + access_ttl_sec;
        let refresh_expires_at = now + refresh_ttl_sec;

        sqlx::query(
            "INSERT INTO sessions (id, user_id, expires_at, revoked_at, refresh_token_hash, refresh_expires_at)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(expires_at)
        .bind(&refresh_hash)
        .bind(refresh_expires_at)
        .execute(&self.pool)
        .await?;

        Ok((
            SessionRecord {
                id,
                user_id: user_id.to_owned(),
                expires_at,
                refresh_token_hash: refresh_hash,
                refresh_expires_at,
            },
            refresh_token,
        ))
    }

    async fn get_active_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, expires_at, refresh_token_hash, refresh_expires_at
             FROM sessions WHERE id = ? AND revoked_at IS NULL AND expires_at > ?",
        )
        .bind(session_id)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SessionRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            expires_at: r.get("expires_at"),
            refresh_token_hash: r.get("refresh_token_hash"),
            refresh_expires_at: r.get("refresh_expires_at"),
        }))
    }

    async fn revoke_session(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET revoked_at = COALESCE(revoked_at, ?) WHERE id = ?")
            .bind(now_sec())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rotate_refresh(
        &self,
        refresh_token: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<Option<(SessionRecord, String)>> {
        let refresh_hash = sha256_hex(refresh_token);
        let row = sqlx::query(
            "SELECT id, user_id FROM sessions
             WHERE refresh_token_hash = ? AND revoked_at IS NULL AND refresh_expires_at > ?",
        )
        .bind(&refresh_hash)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let session_id: String = row.get("id");
        let user_id: String = row.get("user_id");

        let result =
            sqlx::query("UPDATE sessions SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
                .bind(now_sec())
                .bind(&session_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }

        self.create_session(&user_id, access_ttl_sec, refresh_ttl_sec)
            .await
            .map(Some)
    }

    async fn create_anchor_session(
        &self,
        user_id: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<(AnchorSessionRecord, String, String)> {
        let id = format!("{:032x}", rand_u128());
        let access_token = random_token(48);
        let refresh_token = random_token(64);
        let access_hash = sha256_hex(&access_token);
        let refresh_hash = sha256_hex(&refresh_token);
        let now = now_sec();
        let access_expires_at = now + access_ttl_sec;
        let refresh_expires_at = now + refresh_ttl_sec;

        sqlx::query(
            "INSERT INTO anchor_sessions
                (id, user_id, access_token_hash, access_expires_at, refresh_token_hash, refresh_expires_at, revoked_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(&access_hash)
        .bind(access_expires_at)
        .bind(&refresh_hash)
        .bind(refresh_expires_at)
        .execute(&self.pool)
        .await?;

        Ok((
            AnchorSessionRecord {
                id,
                user_id: user_id.to_owned(),
                access_expires_at,
                refresh_token_hash: refresh_hash,
                refresh_expires_at,
            },
            access_token,
            refresh_token,
        ))
    }

    async fn get_active_anchor_session_by_access_token(
        &self,
        access_token: &str,
    ) -> anyhow::Result<Option<AnchorSessionRecord>> {
        let access_hash = sha256_hex(access_token);
        let row = sqlx::query(
            "SELECT id, user_id, access_expires_at, refresh_token_hash, refresh_expires_at
             FROM anchor_sessions
             WHERE access_token_hash = ? AND revoked_at IS NULL AND access_expires_at > ?",
        )
        .bind(access_hash)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AnchorSessionRecord {
            id: r.get("id"),
            user_id: r.get("user_id"),
            access_expires_at: r.get("access_expires_at"),
            refresh_token_hash: r.get("refresh_token_hash"),
            refresh_expires_at: r.get("refresh_expires_at"),
        }))
    }

    async fn rotate_anchor_refresh(
        &self,
        refresh_token: &str,
        access_ttl_sec: i64,
        refresh_ttl_sec: i64,
    ) -> anyhow::Result<Option<(AnchorSessionRecord, String, String)>> {
        let refresh_hash = sha256_hex(refresh_token);
        let row = sqlx::query(
            "SELECT id, user_id FROM anchor_sessions
             WHERE refresh_token_hash = ? AND revoked_at IS NULL AND refresh_expires_at > ?",
        )
        .bind(&refresh_hash)
        .bind(now_sec())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let id: String = row.get("id");
        let user_id: String = row.get("user_id");

        let result = sqlx::query(
            "UPDATE anchor_sessions SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(now_sec())
        .bind(&id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }

        self.create_anchor_session(&user_id, access_ttl_sec, refresh_ttl_sec)
            .await
            .map(Some)
    }
}

fn rand_u128() -> u128 {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    u128::from_be_bytes(bytes)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewArtifact;
    use serde_json::json;

    async fn test_storage() -> SqliteStorage {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        SqliteStorage::init(&pool).await.expect("init");
        SqliteStorage::new(pool)
    }

    #[tokio::test]
    async fn thread_message_retention_evicts_oldest() {
        let storage = test_storage().await;
        for i in 0..5 {
            storage
                .append_thread_message("u1", "t1", &json!({"i": i}), 3)
                .await
                .expect("append");
        }
        let messages = storage
            .list_thread_messages("u1", "t1", 10)
            .await
            .expect("list");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].raw, json!({"i": 2}));
        assert_eq!(messages[2].raw, json!({"i": 4}));
    }

    #[tokio::test]
    async fn upsert_artifact_overwrites_on_conflict() {
        let storage = test_storage().await;
        let make = |summary: &str| NewArtifact {
            user_id: "u1".into(),
            thread_id: "t1".into(),
            item_id: "cmd-1".into(),
            turn_id: None,
            anchor_id: None,
            artifact_type: "command".into(),
            item_type: "commandExecution".into(),
            summary: summary.into(),
            payload: json!({"command": "echo hi"}),
        };

        storage.upsert_artifact(make("first"), 200).await.expect("upsert 1");
        storage.upsert_artifact(make("second"), 200).await.expect("upsert 2");

        let artifacts = storage
            .list_artifacts("u1", Some("t1"), 200, None)
            .await
            .expect("list");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].summary, "second");
    }

    #[tokio::test]
    async fn device_code_consume_is_single_use() {
        let storage = test_storage().await;
        storage
            .create_device_code("dc1", "AAAA-BBBB", 600)
            .await
            .expect("create");
        assert!(storage
            .authorize_device_code("AAAA-BBBB", "user-1")
            .await
            .expect("authorize"));

        let first = storage.consume_device_code("dc1").await.expect("consume");
        assert!(first.is_some());
        let second = storage.consume_device_code("dc1").await.expect("consume again");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn session_refresh_rotation_issues_new_session() {
        let storage = test_storage().await;
        let (session, refresh) = storage
            .create_session("user-1", 3600, 604_800)
            .await
            .expect("create session");

        let rotated = storage
            .rotate_refresh(&refresh, 3600, 604_800)
            .await
            .expect("rotate");
        assert!(rotated.is_some());
        let (new_session, _) = rotated.expect("some");
        assert_ne!(new_session.id, session.id);

        assert!(storage
            .get_active_session(&session.id)
            .await
            .expect("lookup")
            .is_none());
    }
}
