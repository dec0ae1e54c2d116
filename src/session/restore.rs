//! Restore coordinator: rebinds persisted sessions to live handles.
//!
//! Runs once at process startup for every stored session, and on demand
//! when `connect` finds a record with no in-memory handle (the
//! post-restart path). Idempotent: a second call for the same name finds
//! the handle already present and returns it.

use super::handle::SessionHandle;
use super::registry::SessionRegistry;
use crate::error::NotFoundError;
use crate::store::{DeviceStore, SessionStore};
use crate::types::SessionStatus;
use crate::Result;
use std::sync::Arc;

impl SessionRegistry {
    /// Restore every stored session. Paired sessions re-enter the connect
    /// loop so their phones come back online without a QR rescan.
    /// Individual failures are logged and do not abort the batch.
    pub async fn restore_all(&self) {
        let records = match self.store().list_sessions().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to enumerate sessions for restore");
                return;
            }
        };

        for record in records {
            let handle = match self.restore_session(&record.name).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(session = %record.name, error = %e, "failed to restore session");
                    continue;
                }
            };
            if record.device_jid.is_some() {
                if let Err(e) = handle.connect().await {
                    tracing::warn!(session = %record.name, error = %e, "reconnect after restore failed");
                }
            }
        }
    }

    /// Restore one session from its record. No-op when the handle already
    /// exists.
    pub(crate) async fn restore_session(&self, name: &str) -> Result<Arc<SessionHandle>> {
        if let Some(handle) = self.lookup(name).await {
            return Ok(handle);
        }

        let record = self
            .store()
            .get_session_by_name(name)
            .await?
            .ok_or_else(|| NotFoundError::Session(name.to_string()))?;

        // Rebind the stored device identity; a missing entry degrades to a
        // fresh device and the caller will have to scan a QR again.
        let device = match &record.device_jid {
            Some(jid) => {
                let device = self.store().get_device(jid).await?;
                if device.is_none() {
                    tracing::warn!(
                        session = name,
                        device = %jid,
                        "device identity missing from store; restoring as unpaired"
                    );
                }
                device
            }
            None => None,
        };

        let client = self.protocol().client(&record.name, device).await?;

        // Ephemeral columns do not survive a restart.
        self.store()
            .update_session_status(record.id, SessionStatus::Disconnected, None)
            .await?;
        self.store().set_session_qr(record.id, None).await?;

        let mut handles = self.handles().write().await;
        if let Some(existing) = handles.get(name) {
            // Lost the race with a concurrent restore.
            return Ok(Arc::clone(existing));
        }
        let handle = SessionHandle::new(
            &record,
            client,
            Arc::clone(self.store()),
            self.scope().child_token(),
            self.subscribers(),
        )
        .await;
        handles.insert(name.to_string(), Arc::clone(&handle));
        tracing::info!(
            session = name,
            paired = record.device_jid.is_some(),
            "session restored"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolClient, ProtocolFactory, StubFactory};
    use crate::store::{MemoryStore, SessionStore, Store};
    use crate::types::Jid;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn fresh_registry(
        store: Store,
        factory: Arc<StubFactory>,
    ) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            store,
            factory as Arc<dyn ProtocolFactory>,
            Vec::new(),
            CancellationToken::new(),
        ))
    }

    /// Pair a session, then simulate a restart by building a second
    /// registry over the same storage.
    #[tokio::test]
    async fn paired_session_survives_restart() {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = Arc::new(StubFactory::new(mem.clone()));
        let jid = Jid::new_ad("15551234567", 0, 0);

        {
            let registry = fresh_registry(Arc::clone(&store), Arc::clone(&factory));
            registry.create("alice").await.unwrap();
            registry.connect("alice").await.unwrap();
            let stub = factory.client_for("alice").unwrap();
            stub.complete_pairing(jid.clone()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // "Restart": new registry and factory, same storage.
        let factory2 = Arc::new(StubFactory::new(mem));
        let registry2 = fresh_registry(Arc::clone(&store), Arc::clone(&factory2));
        assert!(registry2.lookup("alice").await.is_none());

        registry2.connect("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stub = factory2.client_for("alice").unwrap();
        assert_eq!(stub.device_jid(), Some(jid.clone()));
        assert!(stub.is_logged_in());
        assert!(stub.is_connected());

        let rec = store.get_session_by_name("alice").await.unwrap().unwrap();
        assert_eq!(rec.device_jid, Some(jid));
        // No QR was produced on the restored path.
        assert!(rec.qr_code.is_none());
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = Arc::new(StubFactory::new(mem));
        let registry = fresh_registry(Arc::clone(&store), Arc::clone(&factory));

        store
            .create_session(&crate::store::SessionRecord::new("bob"))
            .await
            .unwrap();
        let first = registry.restore_session("bob").await.unwrap();
        let second = registry.restore_session("bob").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_device_entry_degrades_to_unpaired() {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = Arc::new(StubFactory::new(mem));
        let registry = fresh_registry(Arc::clone(&store), Arc::clone(&factory));

        let mut record = crate::store::SessionRecord::new("carol");
        record.device_jid = Some(Jid::new_ad("1777", 0, 0));
        store.create_session(&record).await.unwrap();
        // No device identity saved for that JID.

        registry.restore_session("carol").await.unwrap();
        let stub = factory.client_for("carol").unwrap();
        assert!(!stub.is_logged_in());
        assert!(stub.device_jid().is_none());
    }

    #[tokio::test]
    async fn restore_all_reconnects_only_paired() {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = Arc::new(StubFactory::new(mem.clone()));
        let jid = Jid::new_ad("1555", 0, 0);

        {
            let registry = fresh_registry(Arc::clone(&store), Arc::clone(&factory));
            registry.create("paired").await.unwrap();
            registry.create("unpaired").await.unwrap();
            registry.connect("paired").await.unwrap();
            let stub = factory.client_for("paired").unwrap();
            stub.complete_pairing(jid).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let factory2 = Arc::new(StubFactory::new(mem));
        let registry2 = fresh_registry(Arc::clone(&store), Arc::clone(&factory2));
        registry2.restore_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry2.lookup("paired").await.is_some());
        assert!(registry2.lookup("unpaired").await.is_some());
        assert!(factory2.client_for("paired").unwrap().is_connected());
        assert!(!factory2.client_for("unpaired").unwrap().is_connected());
    }
}
