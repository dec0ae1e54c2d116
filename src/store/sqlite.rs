//! SQLite-backed storage.
//!
//! Plain `sqlx::query` with binds, WAL journal mode, inline migrations.
//! Identifiers and timestamps are stored as TEXT.

use super::{
    DeviceIdentity, DeviceStore, MessageRecord, MessageStore, SessionRecord, SessionStore,
    SyncStatus,
};
use crate::error::StoreError;
use crate::types::{Jid, ProxyConfig, SessionStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Durable store over one SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the store at the given URL, e.g. `sqlite://gateway.db`.
    pub async fn open(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                device_jid      TEXT,
                status          TEXT NOT NULL DEFAULT 'disconnected',
                connected       INTEGER NOT NULL DEFAULT 0,
                connection_error TEXT,
                qr_code         TEXT,
                qr_expires_at   TEXT,
                proxy           TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                connected_at    TEXT,
                last_seen       TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                session_id      TEXT NOT NULL,
                remote_id       TEXT NOT NULL,
                sender          TEXT NOT NULL,
                chat            TEXT NOT NULL,
                from_me         INTEGER NOT NULL DEFAULT 0,
                msg_type        TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                payload         TEXT NOT NULL,
                sync_status     TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_session_remote
                ON messages (session_id, remote_id);
            CREATE TABLE IF NOT EXISTS devices (
                jid             TEXT PRIMARY KEY,
                noise_key       BLOB NOT NULL,
                identity_key    BLOB NOT NULL,
                registration_id INTEGER NOT NULL,
                created_at      TEXT NOT NULL
            );
        "#;
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

fn parse_uuid(s: &str) -> std::result::Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Load(format!("bad uuid {s:?}: {e}")))
}

fn parse_jid(s: &str) -> std::result::Result<Jid, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Load(format!("bad jid {s:?}")))
}

fn row_to_session(row: &SqliteRow) -> std::result::Result<SessionRecord, StoreError> {
    let status: String = row.get("status");
    let device_jid: Option<String> = row.get("device_jid");
    let proxy: Option<String> = row.get("proxy");
    Ok(SessionRecord {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        name: row.get("name"),
        device_jid: device_jid.as_deref().map(parse_jid).transpose()?,
        status: status
            .parse::<SessionStatus>()
            .map_err(StoreError::Load)?,
        connected: row.get("connected"),
        connection_error: row.get("connection_error"),
        qr_code: row.get("qr_code"),
        qr_expires_at: row.get("qr_expires_at"),
        proxy: proxy
            .as_deref()
            .map(serde_json::from_str::<ProxyConfig>)
            .transpose()
            .map_err(|e| StoreError::Load(e.to_string()))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        connected_at: row.get("connected_at"),
        last_seen: row.get("last_seen"),
    })
}

fn row_to_message(row: &SqliteRow) -> std::result::Result<MessageRecord, StoreError> {
    let payload: String = row.get("payload");
    let sync: String = row.get("sync_status");
    Ok(MessageRecord {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        remote_id: row.get("remote_id"),
        sender: parse_jid(&row.get::<String, _>("sender"))?,
        chat: parse_jid(&row.get::<String, _>("chat"))?,
        from_me: row.get("from_me"),
        msg_type: row.get("msg_type"),
        timestamp: row.get("timestamp"),
        payload: serde_json::from_str(&payload).map_err(|e| StoreError::Load(e.to_string()))?,
        sync_status: SyncStatus::parse(&sync)
            .ok_or_else(|| StoreError::Load(format!("bad sync status {sync:?}")))?,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, rec: &SessionRecord) -> Result<()> {
        let proxy = rec
            .proxy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO sessions
               (id, name, device_jid, status, connected, connection_error,
                qr_code, qr_expires_at, proxy, created_at, updated_at, connected_at, last_seen)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(rec.id.to_string())
        .bind(&rec.name)
        .bind(rec.device_jid.as_ref().map(|j| j.to_string()))
        .bind(rec.status.as_str())
        .bind(rec.connected)
        .bind(&rec.connection_error)
        .bind(&rec.qr_code)
        .bind(rec.qr_expires_at)
        .bind(proxy)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .bind(rec.connected_at)
        .bind(rec.last_seen)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn get_session_by_name(&self, name: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.as_ref().map(row_to_session).transpose()?)
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.as_ref().map(row_to_session).transpose()?)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_to_session(row)?);
        }
        Ok(out)
    }

    async fn session_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.is_some())
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        connection_error: Option<&str>,
    ) -> Result<()> {
        let connected = status == SessionStatus::Connected;
        let error = if connected { None } else { connection_error };
        sqlx::query(
            r#"UPDATE sessions SET
                   status = ?,
                   connected = ?,
                   connection_error = ?,
                   connected_at = CASE WHEN ? THEN ? ELSE connected_at END,
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(connected)
        .bind(error)
        .bind(connected)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_session_device_jid(&self, id: Uuid, jid: Option<&Jid>) -> Result<()> {
        sqlx::query("UPDATE sessions SET device_jid = ?, updated_at = ? WHERE id = ?")
            .bind(jid.map(|j| j.to_string()))
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_session_qr(&self, id: Uuid, qr: Option<(&str, DateTime<Utc>)>) -> Result<()> {
        sqlx::query("UPDATE sessions SET qr_code = ?, qr_expires_at = ?, updated_at = ? WHERE id = ?")
            .bind(qr.map(|(code, _)| code.to_string()))
            .bind(qr.map(|(_, exp)| exp))
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn set_session_proxy(&self, id: Uuid, proxy: Option<&ProxyConfig>) -> Result<()> {
        let proxy = proxy
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        sqlx::query("UPDATE sessions SET proxy = ?, updated_at = ? WHERE id = ?")
            .bind(proxy)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_seen = ? WHERE id = ?")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, rec: &MessageRecord) -> Result<bool> {
        let payload =
            serde_json::to_string(&rec.payload).map_err(|e| StoreError::Save(e.to_string()))?;
        let result = sqlx::query(
            r#"INSERT INTO messages
               (id, session_id, remote_id, sender, chat, from_me, msg_type, timestamp, payload, sync_status)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id, remote_id) DO NOTHING"#,
        )
        .bind(rec.id.to_string())
        .bind(rec.session_id.to_string())
        .bind(&rec.remote_id)
        .bind(rec.sender.to_string())
        .bind(rec.chat.to_string())
        .bind(rec.from_me)
        .bind(&rec.msg_type)
        .bind(rec.timestamp)
        .bind(payload)
        .bind(rec.sync_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_message(
        &self,
        session_id: Uuid,
        remote_id: &str,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM messages WHERE session_id = ? AND remote_id = ?")
            .bind(session_id.to_string())
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(row.as_ref().map(row_to_message).transpose()?)
    }

    async fn update_message_sync(&self, id: Uuid, status: SyncStatus) -> Result<()> {
        sqlx::query("UPDATE messages SET sync_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn count_messages(&self, session_id: Uuid) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn get_device(&self, jid: &Jid) -> Result<Option<DeviceIdentity>> {
        let row = sqlx::query("SELECT * FROM devices WHERE jid = ?")
            .bind(jid.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(DeviceIdentity {
            jid: parse_jid(&row.get::<String, _>("jid"))?,
            noise_key: row.get("noise_key"),
            identity_key: row.get("identity_key"),
            registration_id: row.get::<i64, _>("registration_id") as u32,
            created_at: row.get("created_at"),
        }))
    }

    async fn save_device(&self, device: &DeviceIdentity) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO devices (jid, noise_key, identity_key, registration_id, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(jid) DO UPDATE SET
                   noise_key = excluded.noise_key,
                   identity_key = excluded.identity_key,
                   registration_id = excluded.registration_id"#,
        )
        .bind(device.jid.to_string())
        .bind(&device.noise_key)
        .bind(&device.identity_key)
        .bind(device.registration_id as i64)
        .bind(device.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn delete_device(&self, jid: &Jid) -> Result<()> {
        sqlx::query("DELETE FROM devices WHERE jid = ?")
            .bind(jid.to_string())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());
        (SqliteStore::open(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn session_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());

        let rec = SessionRecord::new("alice");
        {
            let store = SqliteStore::open(&url).await.unwrap();
            store.create_session(&rec).await.unwrap();
            store
                .set_session_device_jid(rec.id, Some(&Jid::new_ad("15551234567", 0, 0)))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&url).await.unwrap();
        let loaded = store.get_session_by_name("alice").await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(
            loaded.device_jid.unwrap().to_string(),
            "15551234567.0:0@s.whatsapp.net"
        );
    }

    #[tokio::test]
    async fn duplicate_name_rejected_by_unique_index() {
        let (store, _dir) = open_temp().await;
        store.create_session(&SessionRecord::new("dup")).await.unwrap();
        assert!(store.create_session(&SessionRecord::new("dup")).await.is_err());
    }

    #[tokio::test]
    async fn message_conflict_is_silent_dedupe() {
        let (store, _dir) = open_temp().await;
        let session = SessionRecord::new("m");
        store.create_session(&session).await.unwrap();
        let rec = MessageRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            remote_id: "3EB0CCCC".into(),
            sender: Jid::new("1", "s.whatsapp.net"),
            chat: Jid::new("1", "s.whatsapp.net"),
            from_me: false,
            msg_type: "text".into(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"body": "hello"}),
            sync_status: SyncStatus::Pending,
        };
        assert!(store.insert_message(&rec).await.unwrap());
        let dup = MessageRecord {
            id: Uuid::new_v4(),
            ..rec.clone()
        };
        assert!(!store.insert_message(&dup).await.unwrap());
        assert_eq!(store.count_messages(session.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn proxy_and_qr_columns_roundtrip() {
        let (store, _dir) = open_temp().await;
        let rec = SessionRecord::new("p");
        store.create_session(&rec).await.unwrap();

        let proxy = ProxyConfig {
            url: "socks5://host:1080".into(),
        };
        store.set_session_proxy(rec.id, Some(&proxy)).await.unwrap();
        let exp = Utc::now() + chrono::Duration::seconds(30);
        store.set_session_qr(rec.id, Some(("2@code", exp))).await.unwrap();

        let loaded = store.get_session_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.proxy.unwrap(), proxy);
        assert_eq!(loaded.qr_code.as_deref(), Some("2@code"));

        store.set_session_proxy(rec.id, None).await.unwrap();
        let loaded = store.get_session_by_id(rec.id).await.unwrap().unwrap();
        assert!(loaded.proxy.is_none());
    }

    #[tokio::test]
    async fn device_upsert_and_delete() {
        let (store, _dir) = open_temp().await;
        let jid = Jid::new_ad("111", 0, 0);
        let dev = DeviceIdentity {
            jid: jid.clone(),
            noise_key: vec![7; 32],
            identity_key: vec![9; 32],
            registration_id: 7,
            created_at: Utc::now(),
        };
        store.save_device(&dev).await.unwrap();
        store.save_device(&dev).await.unwrap();
        let loaded = store.get_device(&jid).await.unwrap().unwrap();
        assert_eq!(loaded.registration_id, 7);
        store.delete_device(&jid).await.unwrap();
        assert!(store.get_device(&jid).await.unwrap().is_none());
    }
}
