use super::{
    DeviceIdentity, DeviceStore, MessageRecord, MessageStore, SessionRecord, SessionStore,
    SyncStatus,
};
use crate::error::StoreError;
use crate::types::{Jid, ProxyConfig, SessionStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-memory store (for testing or single-run; not persistent).
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
    messages: RwLock<HashMap<(Uuid, String), MessageRecord>>,
    devices: RwLock<HashMap<String, DeviceIdentity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
        }
    }

    fn with_session<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<R> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        let rec = sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::Save(format!("session {id} not found")))?;
        let out = f(rec);
        rec.updated_at = Utc::now();
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, rec: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(rec.id, rec.clone());
        Ok(())
    }

    async fn get_session_by_name(&self, name: &str) -> Result<Option<SessionRecord>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(sessions.values().find(|r| r.name == name).cloned())
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(sessions.get(&id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn session_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_session_by_name(name).await?.is_some())
    }

    async fn update_session_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        connection_error: Option<&str>,
    ) -> Result<()> {
        self.with_session(id, |rec| {
            rec.status = status;
            rec.connected = status == SessionStatus::Connected;
            if rec.connected {
                rec.connected_at = Some(Utc::now());
                rec.connection_error = None;
            } else {
                rec.connection_error = connection_error.map(str::to_string);
            }
        })
    }

    async fn set_session_device_jid(&self, id: Uuid, jid: Option<&Jid>) -> Result<()> {
        self.with_session(id, |rec| rec.device_jid = jid.cloned())
    }

    async fn set_session_qr(&self, id: Uuid, qr: Option<(&str, DateTime<Utc>)>) -> Result<()> {
        self.with_session(id, |rec| match qr {
            Some((code, exp)) => {
                rec.qr_code = Some(code.to_string());
                rec.qr_expires_at = Some(exp);
            }
            None => {
                rec.qr_code = None;
                rec.qr_expires_at = None;
            }
        })
    }

    async fn set_session_proxy(&self, id: Uuid, proxy: Option<&ProxyConfig>) -> Result<()> {
        self.with_session(id, |rec| rec.proxy = proxy.cloned())
    }

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_session(id, |rec| rec.last_seen = Some(at))
    }

    async fn delete_session(&self, id: Uuid) -> Result<()> {
        self.sessions
            .write()
            .map_err(|e| StoreError::Delete(e.to_string()))?
            .remove(&id);
        self.messages
            .write()
            .map_err(|e| StoreError::Delete(e.to_string()))?
            .retain(|(sid, _), _| *sid != id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, rec: &MessageRecord) -> Result<bool> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        let key = (rec.session_id, rec.remote_id.clone());
        if messages.contains_key(&key) {
            return Ok(false);
        }
        messages.insert(key, rec.clone());
        Ok(true)
    }

    async fn get_message(
        &self,
        session_id: Uuid,
        remote_id: &str,
    ) -> Result<Option<MessageRecord>> {
        let messages = self
            .messages
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(messages.get(&(session_id, remote_id.to_string())).cloned())
    }

    async fn update_message_sync(&self, id: Uuid, status: SyncStatus) -> Result<()> {
        let mut messages = self
            .messages
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?;
        for rec in messages.values_mut() {
            if rec.id == id {
                rec.sync_status = status;
                return Ok(());
            }
        }
        Err(StoreError::Save(format!("message {id} not found")).into())
    }

    async fn count_messages(&self, session_id: Uuid) -> Result<u64> {
        let messages = self
            .messages
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(messages.keys().filter(|(sid, _)| *sid == session_id).count() as u64)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_device(&self, jid: &Jid) -> Result<Option<DeviceIdentity>> {
        let devices = self
            .devices
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(devices.get(&jid.to_string()).cloned())
    }

    async fn save_device(&self, device: &DeviceIdentity) -> Result<()> {
        self.devices
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(device.jid.to_string(), device.clone());
        Ok(())
    }

    async fn delete_device(&self, jid: &Jid) -> Result<()> {
        self.devices
            .write()
            .map_err(|e| StoreError::Delete(e.to_string()))?
            .remove(&jid.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_create_get_delete() {
        let store = MemoryStore::new();
        let rec = SessionRecord::new("alice");
        store.create_session(&rec).await.unwrap();

        assert!(store.session_exists("alice").await.unwrap());
        let loaded = store.get_session_by_name("alice").await.unwrap().unwrap();
        assert_eq!(loaded.id, rec.id);
        assert_eq!(loaded.status, SessionStatus::Disconnected);

        store.delete_session(rec.id).await.unwrap();
        assert!(!store.session_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn status_update_clears_error_when_connected() {
        let store = MemoryStore::new();
        let rec = SessionRecord::new("bob");
        store.create_session(&rec).await.unwrap();

        store
            .update_session_status(rec.id, SessionStatus::Disconnected, Some("dial tcp: refused"))
            .await
            .unwrap();
        let loaded = store.get_session_by_id(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.connection_error.as_deref(), Some("dial tcp: refused"));
        assert!(!loaded.connected);

        store
            .update_session_status(rec.id, SessionStatus::Connected, None)
            .await
            .unwrap();
        let loaded = store.get_session_by_id(rec.id).await.unwrap().unwrap();
        assert!(loaded.connected);
        assert!(loaded.connection_error.is_none());
        assert!(loaded.connected_at.is_some());
    }

    #[tokio::test]
    async fn message_dedupe_by_remote_id() {
        let store = MemoryStore::new();
        let session = Uuid::new_v4();
        let rec = MessageRecord {
            id: Uuid::new_v4(),
            session_id: session,
            remote_id: "3EB0AAAA".into(),
            sender: Jid::new("1", "s.whatsapp.net"),
            chat: Jid::new("1", "s.whatsapp.net"),
            from_me: false,
            msg_type: "text".into(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"body": "hi"}),
            sync_status: SyncStatus::Pending,
        };
        assert!(store.insert_message(&rec).await.unwrap());
        let dup = MessageRecord {
            id: Uuid::new_v4(),
            ..rec.clone()
        };
        assert!(!store.insert_message(&dup).await.unwrap());
        assert_eq!(store.count_messages(session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn message_sync_status_update() {
        let store = MemoryStore::new();
        let rec = MessageRecord {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            remote_id: "3EB0BBBB".into(),
            sender: Jid::new("2", "s.whatsapp.net"),
            chat: Jid::new("2", "s.whatsapp.net"),
            from_me: false,
            msg_type: "text".into(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"body": "x"}),
            sync_status: SyncStatus::Pending,
        };
        store.insert_message(&rec).await.unwrap();
        store
            .update_message_sync(rec.id, SyncStatus::Synced)
            .await
            .unwrap();
        let loaded = store
            .get_message(rec.session_id, "3EB0BBBB")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn device_roundtrip() {
        let store = MemoryStore::new();
        let jid = Jid::new_ad("15551234567", 0, 0);
        let dev = DeviceIdentity {
            jid: jid.clone(),
            noise_key: vec![1; 32],
            identity_key: vec![2; 32],
            registration_id: 42,
            created_at: Utc::now(),
        };
        store.save_device(&dev).await.unwrap();
        assert!(store.get_device(&jid).await.unwrap().is_some());
        store.delete_device(&jid).await.unwrap();
        assert!(store.get_device(&jid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn qr_material_set_and_clear() {
        let store = MemoryStore::new();
        let rec = SessionRecord::new("carol");
        store.create_session(&rec).await.unwrap();

        let exp = Utc::now() + chrono::Duration::seconds(30);
        store
            .set_session_qr(rec.id, Some(("2@abcdef", exp)))
            .await
            .unwrap();
        let loaded = store.get_session_by_name("carol").await.unwrap().unwrap();
        assert!(loaded.live_qr(Utc::now()).is_some());

        store.set_session_qr(rec.id, None).await.unwrap();
        let loaded = store.get_session_by_name("carol").await.unwrap().unwrap();
        assert!(loaded.live_qr(Utc::now()).is_none());
    }
}
