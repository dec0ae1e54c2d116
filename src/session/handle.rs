//! One live session: protocol client, state machine, task scopes.

use super::{dispatch, pairing};
use crate::error::{ConflictError, UnavailableError, ValidationError};
use crate::protocol::{OutgoingContent, ProtocolClient};
use crate::store::{SessionRecord, SessionStore, Store};
use crate::subscriber::{EventSubscriber, Fanout};
use crate::types::{Event, Jid, MediaKind, ProxyConfig, SessionStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result of a send operation, as reported to API callers.
#[derive(Clone, Debug, Serialize)]
pub struct SendReceipt {
    /// Remote message id assigned by the protocol.
    pub message_id: String,
    /// Always `"sent"`: the gateway reports acceptance, not delivery.
    pub status: &'static str,
    /// Protocol-reported timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of a handle for the info endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub status: SessionStatus,
    pub connected: bool,
    pub logged_in: bool,
    pub device_jid: Option<Jid>,
    pub proxy: Option<ProxyConfig>,
    pub last_activity: DateTime<Utc>,
}

struct QrMaterial {
    code: String,
    expires_at: DateTime<Utc>,
}

/// State-machine fields, all mutated under one lock. The lock is never
/// held across a suspension point.
struct HandleState {
    status: SessionStatus,
    qr: Option<QrMaterial>,
    proxy: Option<ProxyConfig>,
    last_activity: DateTime<Utc>,
}

/// In-memory representation of one live session.
///
/// Scope hierarchy: the handle scope is a child of the process scope and
/// parents both the per-connection scope and, transitively, the pairing
/// scope. Cancelling the handle tears down every task it spawned.
pub struct SessionHandle {
    id: Uuid,
    name: String,
    client: Arc<dyn ProtocolClient>,
    store: Store,
    scope: CancellationToken,
    conn: Mutex<CancellationToken>,
    pairing: Mutex<Option<CancellationToken>>,
    state: Mutex<HandleState>,
    fanout: Fanout,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl SessionHandle {
    /// Build a handle around a session record, wire the dispatcher and
    /// fan-out, and subscribe to the protocol client's event stream.
    pub(crate) async fn new(
        record: &SessionRecord,
        client: Arc<dyn ProtocolClient>,
        store: Store,
        scope: CancellationToken,
        subscribers: &[Arc<dyn EventSubscriber>],
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fanout = Fanout::new(&record.name, record.id, scope.clone());
        for sub in subscribers {
            fanout.attach(Arc::clone(sub));
        }

        let handle = Arc::new(Self {
            id: record.id,
            name: record.name.clone(),
            client,
            store,
            conn: Mutex::new(scope.child_token()),
            scope,
            pairing: Mutex::new(None),
            state: Mutex::new(HandleState {
                status: SessionStatus::Disconnected,
                qr: None,
                proxy: record.proxy.clone(),
                last_activity: Utc::now(),
            }),
            fanout,
            events_tx,
        });

        dispatch::spawn(Arc::clone(&handle), events_rx);
        let tx = handle.events_tx.clone();
        handle
            .client
            .add_event_handler(Box::new(move |evt| {
                // The dispatcher task does all real work; losing events
                // after shutdown is expected.
                let _ = tx.send(evt);
            }))
            .await;
        handle
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .proxy
            .clone()
    }

    pub fn info(&self) -> SessionInfo {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SessionInfo {
            status: st.status,
            connected: self.client.is_connected(),
            logged_in: self.client.is_logged_in(),
            device_jid: self.client.device_jid(),
            proxy: st.proxy.clone(),
            last_activity: st.last_activity,
        }
    }

    /// Connect the session.
    ///
    /// No-op when already `connecting` or `connected`. In `qr_code` the
    /// outstanding pairing attempt is abandoned and a fresh one starts
    /// (callers expect "refresh"). A paired device skips the QR phase.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let status = self.status();
        if status.is_connect_in_progress() && status != SessionStatus::QrCode {
            return Ok(());
        }

        self.cancel_pairing();
        let conn = self.reopen_conn_scope();

        if let Some(proxy) = self.proxy() {
            if let Err(e) = self.client.set_proxy(&proxy.url).await {
                tracing::warn!(session = %self.name, error = %e, "failed to apply proxy before connect");
            }
        }

        if self.client.device_jid().is_some() {
            if self.client.is_connected() {
                // The protocol connection is already live; the dispatcher
                // settles the status from its event stream.
                return Ok(());
            }
            // Paired: straight to protocol connect, no QR phase.
            self.set_status_persisted(SessionStatus::Connecting, None).await;
            if let Err(e) = self.client.connect().await {
                self.set_status_persisted(SessionStatus::Disconnected, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
            return Ok(());
        }

        // Unpaired: open the QR stream first so a failure surfaces to the
        // caller as a transient error, then drive pairing off-path.
        let qr_rx = match self.client.qr_channel().await {
            Ok(rx) => rx,
            Err(e) => {
                self.set_status_persisted(SessionStatus::Disconnected, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        };

        self.clear_qr_persisted().await;
        self.set_status_persisted(SessionStatus::Connecting, None).await;

        let token = conn.child_token();
        *self
            .pairing
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        pairing::spawn(Arc::clone(self), qr_rx, token);
        Ok(())
    }

    /// Tear down the connection. The device identity is untouched, so a
    /// later connect resumes without a QR scan.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel_pairing();
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.client.disconnect().await;
        self.set_status_persisted(SessionStatus::Disconnected, None).await;
        Ok(())
    }

    /// Unpair: protocol-side logout (which erases the device identity),
    /// then clear the stored device JID. External state mutates first; a
    /// protocol failure leaves the record untouched.
    pub async fn logout(&self) -> Result<()> {
        if !self.client.is_logged_in() {
            return Err(ConflictError::NotLoggedIn.into());
        }
        self.cancel_pairing();
        self.client.logout().await?;
        if let Err(e) = self.store.set_session_device_jid(self.id, None).await {
            tracing::error!(session = %self.name, error = %e, "failed to clear device jid after logout");
        }
        self.set_status_persisted(SessionStatus::LoggedOut, None).await;
        Ok(())
    }

    /// Current pairing code.
    pub fn qr(&self) -> Result<(String, DateTime<Utc>)> {
        if self.client.is_logged_in() {
            return Err(ConflictError::AlreadyLoggedIn.into());
        }
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !matches!(
            st.status,
            SessionStatus::Connecting | SessionStatus::QrCode
        ) {
            return Err(ConflictError::NotConnected.into());
        }
        match &st.qr {
            None => Err(UnavailableError::NoQrAvailable.into()),
            Some(qr) if qr.expires_at <= Utc::now() => Err(UnavailableError::QrExpired.into()),
            Some(qr) => Ok((qr.code.clone(), qr.expires_at)),
        }
    }

    /// Store a proxy for this session. Takes effect immediately when
    /// connected, otherwise on the next connect.
    pub async fn set_proxy(&self, proxy: ProxyConfig) -> Result<()> {
        proxy
            .validate()
            .map_err(|reason| ValidationError::Proxy(reason))?;
        if self.client.is_connected() {
            self.client.set_proxy(&proxy.url).await?;
        }
        self.store.set_session_proxy(self.id, Some(&proxy)).await?;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .proxy = Some(proxy);
        Ok(())
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt> {
        if body.is_empty() {
            return Err(ValidationError::Payload("empty message body".into()).into());
        }
        self.send(to, OutgoingContent::Text { body: body.to_string() })
            .await
    }

    pub async fn send_media(
        &self,
        to: &str,
        kind: MediaKind,
        url: &str,
        mime_type: &str,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        if url.is_empty() {
            return Err(ValidationError::Payload("empty media url".into()).into());
        }
        if mime_type.is_empty() {
            return Err(ValidationError::Payload("empty mime type".into()).into());
        }
        self.send(
            to,
            OutgoingContent::Media {
                kind,
                url: url.to_string(),
                mime_type: mime_type.to_string(),
                caption,
            },
        )
        .await
    }

    pub async fn send_location(
        &self,
        to: &str,
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    ) -> Result<SendReceipt> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::Payload("coordinates out of range".into()).into());
        }
        self.send(
            to,
            OutgoingContent::Location {
                latitude,
                longitude,
                name,
            },
        )
        .await
    }

    pub async fn send_contact(
        &self,
        to: &str,
        display_name: &str,
        vcard: &str,
    ) -> Result<SendReceipt> {
        if vcard.is_empty() {
            return Err(ValidationError::Payload("empty vcard".into()).into());
        }
        self.send(
            to,
            OutgoingContent::Contact {
                display_name: display_name.to_string(),
                vcard: vcard.to_string(),
            },
        )
        .await
    }

    async fn send(&self, to: &str, content: OutgoingContent) -> Result<SendReceipt> {
        if !(self.client.is_connected() && self.client.is_logged_in()) {
            return Err(ConflictError::NotLoggedIn.into());
        }
        let recipient = Jid::parse_recipient(to)
            .ok_or_else(|| ValidationError::Recipient(to.to_string()))?;
        let resp = self.client.send_message(&recipient, content).await?;

        let now = Utc::now();
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity = now;
        if let Err(e) = self.store.touch_session(self.id, now).await {
            tracing::warn!(session = %self.name, error = %e, "failed to touch last-seen");
        }

        Ok(SendReceipt {
            message_id: resp.id,
            status: "sent",
            timestamp: resp.timestamp,
        })
    }

    // ---- internals shared with the dispatcher and pairing driver ----

    pub(crate) fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub(crate) fn events_tx(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Cancel the per-handle scope. Cascades into the connection scope,
    /// the pairing driver, the dispatcher, and all forwarder tasks.
    pub(crate) fn cancel_scope(&self) {
        self.scope.cancel();
    }

    /// At most one pairing driver is alive per handle; this ends it.
    pub(crate) fn cancel_pairing(&self) {
        if let Some(token) = self
            .pairing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    fn reopen_conn_scope(&self) -> CancellationToken {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if conn.is_cancelled() {
            *conn = self.scope.child_token();
        }
        conn.clone()
    }

    pub(crate) fn touch(&self, at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity = at;
    }

    /// Transition the in-memory state machine and upsert the record.
    /// Storage failures are logged, never propagated: the pipeline must
    /// keep processing subsequent events.
    pub(crate) async fn set_status_persisted(
        &self,
        status: SessionStatus,
        connection_error: Option<&str>,
    ) {
        let previous = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = st.status;
            st.status = status;
            previous
        };
        if previous != status {
            tracing::debug!(
                session = %self.name,
                from = %previous,
                to = %status,
                "session status transition"
            );
        }
        if let Err(e) = self
            .store
            .update_session_status(self.id, status, connection_error)
            .await
        {
            tracing::error!(session = %self.name, error = %e, "failed to persist session status");
        }
    }

    pub(crate) async fn set_qr_persisted(&self, code: String, expires_at: DateTime<Utc>) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.qr = Some(QrMaterial {
                code: code.clone(),
                expires_at,
            });
        }
        if let Err(e) = self
            .store
            .set_session_qr(self.id, Some((&code, expires_at)))
            .await
        {
            tracing::error!(session = %self.name, error = %e, "failed to persist qr code");
        }
    }

    pub(crate) async fn clear_qr_persisted(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .qr = None;
        if let Err(e) = self.store.set_session_qr(self.id, None).await {
            tracing::error!(session = %self.name, error = %e, "failed to clear qr code");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolFactory, StubFactory};
    use crate::store::{MemoryStore, SessionStore};
    use crate::subscriber::DeliveryContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fresh_handle() -> (Arc<SessionHandle>, Arc<crate::protocol::StubClient>, Store) {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = StubFactory::new(mem);
        let record = SessionRecord::new("h");
        store.create_session(&record).await.unwrap();
        let client = factory.client("h", None).await.unwrap();
        let handle = SessionHandle::new(
            &record,
            client,
            Arc::clone(&store),
            CancellationToken::new(),
            &[],
        )
        .await;
        let stub = factory.client_for("h").unwrap();
        (handle, stub, store)
    }

    #[tokio::test]
    async fn qr_unavailable_before_connect() {
        let (handle, _stub, _store) = fresh_handle().await;
        assert!(matches!(
            handle.qr(),
            Err(crate::Error::Conflict(ConflictError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn logout_requires_login() {
        let (handle, _stub, _store) = fresh_handle().await;
        assert!(matches!(
            handle.logout().await,
            Err(crate::Error::Conflict(ConflictError::NotLoggedIn))
        ));
    }

    #[tokio::test]
    async fn send_requires_login() {
        let (handle, _stub, _store) = fresh_handle().await;
        assert!(matches!(
            handle.send_text("5511999999999", "hi").await,
            Err(crate::Error::Conflict(ConflictError::NotLoggedIn))
        ));
    }

    #[tokio::test]
    async fn send_rejects_bad_recipient() {
        let (handle, stub, _store) = fresh_handle().await;
        stub.complete_pairing(Jid::new_ad("1", 0, 0)).await.unwrap();
        handle.connect().await.unwrap();
        let res = handle.send_text("???", "hi").await;
        assert!(matches!(res, Err(crate::Error::Validation(_))));
    }

    #[derive(Default)]
    struct ConnectedCounter(AtomicUsize);

    #[async_trait::async_trait]
    impl EventSubscriber for ConnectedCounter {
        fn name(&self) -> &'static str {
            "connected-counter"
        }

        async fn deliver(&self, _ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
            if matches!(event, Event::Connected) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_is_noop_while_still_connecting() {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = StubFactory::new(mem);
        let record = SessionRecord::new("h2");
        store.create_session(&record).await.unwrap();
        let client = factory.client("h2", None).await.unwrap();
        let counter = Arc::new(ConnectedCounter::default());
        let handle = SessionHandle::new(
            &record,
            client,
            Arc::clone(&store),
            CancellationToken::new(),
            &[Arc::clone(&counter) as Arc<dyn EventSubscriber>],
        )
        .await;
        let stub = factory.client_for("h2").unwrap();
        stub.complete_pairing(Jid::new_ad("42", 0, 0)).await.unwrap();

        // Back-to-back connects; the second lands before the dispatcher
        // has observed the protocol's Connected event.
        handle.connect().await.unwrap();
        handle.connect().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(handle.status(), SessionStatus::Connected);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn proxy_validation_and_storage() {
        let (handle, stub, store) = fresh_handle().await;
        let bad = ProxyConfig { url: "nope".into() };
        assert!(handle.set_proxy(bad).await.is_err());

        let good = ProxyConfig {
            url: "socks5://proxy:1080".into(),
        };
        handle.set_proxy(good.clone()).await.unwrap();
        assert_eq!(handle.proxy(), Some(good.clone()));
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert_eq!(rec.proxy, Some(good));
        // Not connected yet, so nothing was pushed to the client.
        assert!(stub.proxy().is_none());
    }
}
