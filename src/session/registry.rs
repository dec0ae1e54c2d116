//! Process-wide session registry.
//!
//! Owns the name → handle map. Mutations take the exclusive lock, reads
//! the shared one; no lock is ever held across a protocol call.

use super::handle::{SendReceipt, SessionHandle, SessionInfo};
use crate::error::{ConflictError, NotFoundError, ValidationError};
use crate::protocol::ProtocolFactory;
use crate::store::{SessionRecord, SessionStore, Store};
use crate::subscriber::EventSubscriber;
use crate::types::{MediaKind, ProxyConfig};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const NAME_MAX_LEN: usize = 100;

/// Registry of live sessions. Built once in the process entry point and
/// handed to the HTTP layer; there is no module-level singleton.
pub struct SessionRegistry {
    handles: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: Store,
    protocol: Arc<dyn ProtocolFactory>,
    /// Process-wide subscribers, pre-attached to every new handle.
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    scope: CancellationToken,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(ValidationError::SessionName {
            name: name.to_string(),
            reason: "must be 1-100 characters",
        }
        .into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::SessionName {
            name: name.to_string(),
            reason: "allowed characters are A-Z a-z 0-9 _ -",
        }
        .into());
    }
    Ok(())
}

impl SessionRegistry {
    pub fn new(
        store: Store,
        protocol: Arc<dyn ProtocolFactory>,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            store,
            protocol,
            subscribers,
            scope,
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn protocol(&self) -> &Arc<dyn ProtocolFactory> {
        &self.protocol
    }

    pub(crate) fn subscribers(&self) -> &[Arc<dyn EventSubscriber>] {
        &self.subscribers
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn handles(&self) -> &RwLock<HashMap<String, Arc<SessionHandle>>> {
        &self.handles
    }

    /// Create a session with a fresh (unpaired) device identity.
    pub async fn create(&self, name: &str) -> Result<SessionRecord> {
        validate_name(name)?;

        let mut handles = self.handles.write().await;
        if handles.contains_key(name) || self.store.session_exists(name).await? {
            return Err(ConflictError::AlreadyExists(name.to_string()).into());
        }

        let record = SessionRecord::new(name);
        self.store.create_session(&record).await?;

        let client = self.protocol.client(name, None).await?;
        let handle = SessionHandle::new(
            &record,
            client,
            Arc::clone(&self.store),
            self.scope.child_token(),
            &self.subscribers,
        )
        .await;
        handles.insert(name.to_string(), handle);
        tracing::info!(session = name, id = %record.id, "session created");
        Ok(record)
    }

    /// Purely in-memory lookup.
    pub async fn lookup(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.handles.read().await.get(name).cloned()
    }

    async fn resolve(&self, name: &str) -> Result<Arc<SessionHandle>> {
        self.lookup(name)
            .await
            .ok_or_else(|| NotFoundError::Session(name.to_string()).into())
    }

    /// Connect a session, transparently restoring it from storage after a
    /// process restart.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let handle = match self.lookup(name).await {
            Some(handle) => handle,
            None => self.restore_session(name).await?,
        };
        handle.connect().await
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.resolve(name).await?.disconnect().await
    }

    pub async fn logout(&self, name: &str) -> Result<()> {
        self.resolve(name).await?.logout().await
    }

    /// Remove the session entirely. The pairing driver and every other
    /// per-handle task are cancelled; protocol teardown is best-effort
    /// and never blocks deletion. The device identity is retained; a
    /// recreated session of the same name pairs as a brand-new device.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let handle = self.handles.write().await.remove(name);

        let record = match &handle {
            Some(handle) => self.store.get_session_by_id(handle.id()).await?,
            None => self.store.get_session_by_name(name).await?,
        };
        if handle.is_none() && record.is_none() {
            return Err(NotFoundError::Session(name.to_string()).into());
        }

        if let Some(handle) = handle {
            handle.cancel_scope();
            handle.client().disconnect().await;
        }
        if let Some(record) = record {
            self.store.delete_session(record.id).await?;
        }
        tracing::info!(session = name, "session deleted");
        Ok(())
    }

    pub async fn qr(&self, name: &str) -> Result<(String, DateTime<Utc>)> {
        self.resolve(name).await?.qr()
    }

    pub async fn set_proxy(&self, name: &str, proxy: ProxyConfig) -> Result<()> {
        self.resolve(name).await?.set_proxy(proxy).await
    }

    pub async fn proxy(&self, name: &str) -> Result<Option<ProxyConfig>> {
        Ok(self.resolve(name).await?.proxy())
    }

    /// Session record plus live state, for the info endpoint.
    pub async fn info(&self, name: &str) -> Result<(SessionRecord, Option<SessionInfo>)> {
        let record = self
            .store
            .get_session_by_name(name)
            .await?
            .ok_or_else(|| NotFoundError::Session(name.to_string()))?;
        let live = self.lookup(name).await.map(|h| h.info());
        Ok((record, live))
    }

    /// All session records, with live status overlaid for in-memory
    /// handles.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut records = self.store.list_sessions().await?;
        let handles = self.handles.read().await;
        for record in &mut records {
            if let Some(handle) = handles.get(&record.name) {
                record.status = handle.status();
            }
        }
        Ok(records)
    }

    pub async fn send_text(&self, name: &str, to: &str, body: &str) -> Result<SendReceipt> {
        self.resolve(name).await?.send_text(to, body).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_media(
        &self,
        name: &str,
        to: &str,
        kind: MediaKind,
        url: &str,
        mime_type: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        self.resolve(name)
            .await?
            .send_media(to, kind, url, mime_type, caption)
            .await
    }

    pub async fn send_location(
        &self,
        name: &str,
        to: &str,
        latitude: f64,
        longitude: f64,
        location_name: Option<String>,
    ) -> Result<SendReceipt> {
        self.resolve(name)
            .await?
            .send_location(to, latitude, longitude, location_name)
            .await
    }

    pub async fn send_contact(
        &self,
        name: &str,
        to: &str,
        display_name: &str,
        vcard: &str,
    ) -> Result<SendReceipt> {
        self.resolve(name)
            .await?
            .send_contact(to, display_name, vcard)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StubFactory;
    use crate::store::MemoryStore;

    fn registry_with_stub() -> (Arc<SessionRegistry>, Arc<StubFactory>) {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = Arc::new(StubFactory::new(mem));
        let registry = SessionRegistry::new(
            store,
            Arc::clone(&factory) as Arc<dyn ProtocolFactory>,
            Vec::new(),
            CancellationToken::new(),
        );
        (Arc::new(registry), factory)
    }

    #[tokio::test]
    async fn create_rejects_bad_names() {
        let (registry, _f) = registry_with_stub();
        let too_long = "x".repeat(101);
        for bad in ["", "has space", "emoji🦀", "a/b", too_long.as_str()] {
            assert!(
                matches!(registry.create(bad).await, Err(crate::Error::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(registry.create("ok_Name-1").await.is_ok());
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let (registry, _f) = registry_with_stub();
        registry.create("alice").await.unwrap();
        assert!(matches!(
            registry.create("alice").await,
            Err(crate::Error::Conflict(ConflictError::AlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn lookup_and_not_found() {
        let (registry, _f) = registry_with_stub();
        assert!(registry.lookup("ghost").await.is_none());
        assert!(matches!(
            registry.disconnect("ghost").await,
            Err(crate::Error::NotFound(_))
        ));
        assert!(matches!(
            registry.delete("ghost").await,
            Err(crate::Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_then_recreate_is_clean() {
        let (registry, _f) = registry_with_stub();
        let first = registry.create("alice").await.unwrap();
        registry.delete("alice").await.unwrap();
        assert!(registry.lookup("alice").await.is_none());

        let second = registry.create("alice").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.device_jid.is_none());
    }

    #[tokio::test]
    async fn list_overlays_live_status() {
        let (registry, factory) = registry_with_stub();
        registry.create("alice").await.unwrap();
        let stub = factory.client_for("alice").unwrap();
        stub.emit(crate::types::Event::Connected);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, crate::types::SessionStatus::Connected);
    }
}
