//! Persistence capability: session records, message records, device
//! identities.
//!
//! The engine consumes storage through the traits below so the backend is
//! replaceable: [MemoryStore] backs tests and single-run setups,
//! [SqliteStore] is the durable default. All writes are single-row
//! upserts; no transaction spans a suspension point.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::types::{Jid, ProxyConfig, SessionStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Durable record for one session.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionRecord {
    /// Opaque generated identifier.
    pub id: Uuid,
    /// Unique human name, `[A-Za-z0-9_-]{1,100}`.
    pub name: String,
    /// Device address assigned at first successful pairing. Cleared only
    /// by explicit logout.
    pub device_jid: Option<Jid>,
    pub status: SessionStatus,
    pub connected: bool,
    pub connection_error: Option<String>,
    /// Current pairing code, if one is outstanding. A code whose expiry
    /// has passed is treated as absent.
    pub qr_code: Option<String>,
    pub qr_expires_at: Option<DateTime<Utc>>,
    pub proxy: Option<ProxyConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            device_jid: None,
            status: SessionStatus::Disconnected,
            connected: false,
            connection_error: None,
            qr_code: None,
            qr_expires_at: None,
            proxy: None,
            created_at: now,
            updated_at: now,
            connected_at: None,
            last_seen: None,
        }
    }

    /// Current QR code, applying the expiry rule.
    pub fn live_qr(&self, now: DateTime<Utc>) -> Option<(&str, DateTime<Utc>)> {
        match (&self.qr_code, self.qr_expires_at) {
            (Some(code), Some(exp)) if exp > now => Some((code.as_str(), exp)),
            _ => None,
        }
    }
}

/// Sync state of a mirrored inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Durable record for one inbound message, append-only from the engine's
/// viewpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Protocol-assigned message id; unique per session.
    pub remote_id: String,
    pub sender: Jid,
    pub chat: Jid,
    pub from_me: bool,
    /// Type tag of the extracted payload (`text`, `media`, ..., `unknown`).
    pub msg_type: String,
    pub timestamp: DateTime<Utc>,
    /// Typed payload, serialized.
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
}

/// Cryptographic identity backing one device JID. Owned by the protocol
/// layer; the engine only moves it around by JID and never reads the key
/// material.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub jid: Jid,
    pub noise_key: Vec<u8>,
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, rec: &SessionRecord) -> Result<()>;

    async fn get_session_by_name(&self, name: &str) -> Result<Option<SessionRecord>>;

    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<SessionRecord>>;

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    async fn session_exists(&self, name: &str) -> Result<bool>;

    /// Upsert status, the derived connected flag/timestamp, and the
    /// connection error. `connected` implies the stored error is cleared.
    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        connection_error: Option<&str>,
    ) -> Result<()>;

    async fn set_session_device_jid(&self, id: Uuid, jid: Option<&Jid>) -> Result<()>;

    async fn set_session_qr(&self, id: Uuid, qr: Option<(&str, DateTime<Utc>)>) -> Result<()>;

    async fn set_session_proxy(&self, id: Uuid, proxy: Option<&ProxyConfig>) -> Result<()>;

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn delete_session(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert unless a record with the same `(session_id, remote_id)`
    /// already exists. Returns whether a row was written.
    async fn insert_message(&self, rec: &MessageRecord) -> Result<bool>;

    async fn get_message(&self, session_id: Uuid, remote_id: &str)
        -> Result<Option<MessageRecord>>;

    async fn update_message_sync(&self, id: Uuid, status: SyncStatus) -> Result<()>;

    async fn count_messages(&self, session_id: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_device(&self, jid: &Jid) -> Result<Option<DeviceIdentity>>;

    async fn save_device(&self, device: &DeviceIdentity) -> Result<()>;

    async fn delete_device(&self, jid: &Jid) -> Result<()>;
}

/// The full persistence surface the engine needs.
pub trait Storage: SessionStore + MessageStore + DeviceStore {}

impl<T: SessionStore + MessageStore + DeviceStore> Storage for T {}

/// Alias for a shared storage handle (common usage).
pub type Store = Arc<dyn Storage>;
