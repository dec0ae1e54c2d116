//! In-process protocol backend.
//!
//! Simulates the wire protocol behind the [ProtocolClient] surface:
//! pairing codes rotate on a timer, pairing completes through an explicit
//! call instead of a phone scan, sends are acknowledged locally. Used by
//! the test suite and by deployments that have not linked a real backend
//! yet.

use super::{
    EventHandler, OutgoingContent, ProtocolClient, ProtocolFactory, QrChannel, QrEvent,
    SendResponse,
};
use crate::error::UpstreamError;
use crate::store::{DeviceIdentity, DeviceStore};
use crate::types::{Event, Jid, MessageContent, MessageEvent};
use crate::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use rand::RngCore;
use sha2::Digest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the stub rotates pairing codes while unpaired.
const QR_ROTATE_INTERVAL: Duration = Duration::from_secs(20);

struct Inner {
    session: String,
    devices: Arc<dyn DeviceStore>,
    device: RwLock<Option<DeviceIdentity>>,
    connected: AtomicBool,
    handlers: RwLock<Vec<EventHandler>>,
    qr_tx: Mutex<Option<mpsc::Sender<QrEvent>>>,
    proxy: Mutex<Option<String>>,
    fail_connect: Mutex<Option<String>>,
    sent: Mutex<Vec<(Jid, OutgoingContent)>>,
}

impl Inner {
    fn dispatch(&self, evt: Event) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for f in handlers.iter() {
            f(evt.clone());
        }
    }

    fn paired(&self) -> bool {
        self.device
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Simulated protocol client for one session.
pub struct StubClient {
    inner: Arc<Inner>,
}

impl StubClient {
    fn new(session: &str, device: Option<DeviceIdentity>, devices: Arc<dyn DeviceStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: session.to_string(),
                devices,
                device: RwLock::new(device),
                connected: AtomicBool::new(false),
                handlers: RwLock::new(Vec::new()),
                qr_tx: Mutex::new(None),
                proxy: Mutex::new(None),
                fail_connect: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Generate a pairing code: digits, `@`, then an opaque payload.
    fn generate_qr_code() -> String {
        let mut payload = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut payload);
        format!("2@{}", general_purpose::STANDARD.encode(payload))
    }

    /// Generate a message ID (3EB0 + hex of hash).
    fn generate_message_id() -> String {
        let mut data = Vec::with_capacity(8 + 16);
        let now = Utc::now().timestamp().to_be_bytes();
        data.extend_from_slice(&now);
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        data.extend_from_slice(&salt);
        let hash = sha2::Sha256::digest(&data);
        format!("3EB0{}", hex::encode(&hash[..9]).to_uppercase())
    }

    /// Complete the pairing handshake as if the given device scanned the
    /// current code: persists a fresh identity and emits `PairSuccess`.
    pub async fn complete_pairing(&self, jid: Jid) -> Result<()> {
        let mut noise_key = vec![0u8; 32];
        let mut identity_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut noise_key);
        rand::thread_rng().fill_bytes(&mut identity_key);
        let device = DeviceIdentity {
            jid: jid.clone(),
            noise_key,
            identity_key,
            registration_id: rand::random(),
            created_at: Utc::now(),
        };
        self.inner.devices.save_device(&device).await?;
        *self
            .inner
            .device
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(device);
        self.inner.dispatch(Event::PairSuccess { jid });
        Ok(())
    }

    /// Inject an arbitrary event into the handler chain.
    pub fn emit(&self, evt: Event) {
        self.inner.dispatch(evt);
    }

    /// Record an inbound text message and emit it, mimicking receive flows.
    pub fn simulate_incoming_text(&self, id: &str, from: &Jid, body: &str) -> MessageEvent {
        let evt = MessageEvent {
            id: id.to_string(),
            from: from.clone(),
            chat: from.to_non_ad(),
            timestamp: Utc::now(),
            is_from_me: false,
            content: MessageContent::Text {
                body: body.to_string(),
            },
        };
        self.inner.dispatch(Event::Message(evt.clone()));
        evt
    }

    /// Make the next `connect` call fail with the given reason.
    pub fn fail_next_connect(&self, reason: &str) {
        *self
            .inner
            .fail_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason.to_string());
    }

    /// Messages accepted by `send_message`, oldest first.
    pub fn sent_messages(&self) -> Vec<(Jid, OutgoingContent)> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Configured proxy URL, if any.
    pub fn proxy(&self) -> Option<String> {
        self.inner
            .proxy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProtocolClient for StubClient {
    async fn connect(&self) -> Result<()> {
        if let Some(reason) = self
            .inner
            .fail_connect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Err(UpstreamError::Connect(reason).into());
        }

        self.inner.connected.store(true, Ordering::SeqCst);

        if self.inner.paired() {
            self.inner.dispatch(Event::Connected);
            return Ok(());
        }

        // Unpaired: feed the QR stream until pairing completes or the
        // receiver goes away.
        let tx = self
            .inner
            .qr_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(QrEvent::Code {
                    code: Self::generate_qr_code(),
                })
                .await;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(QR_ROTATE_INTERVAL).await;
                    if inner.paired() || !inner.connected.load(Ordering::SeqCst) {
                        break;
                    }
                    if tx
                        .send(QrEvent::Code {
                            code: Self::generate_qr_code(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<()> {
        let jid = self.device_jid();
        if let Some(jid) = jid {
            self.inner.devices.delete_device(&jid).await?;
        }
        *self
            .inner
            .device
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.dispatch(Event::LoggedOut {
            reason: Some("logout requested".to_string()),
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.inner.paired()
    }

    fn device_jid(&self) -> Option<Jid> {
        self.inner
            .device
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|d| d.jid.clone())
    }

    async fn qr_channel(&self) -> Result<QrChannel> {
        if self.inner.paired() {
            return Err(UpstreamError::QrChannel("device is already paired".into()).into());
        }
        let (tx, rx) = mpsc::channel(8);
        *self
            .inner
            .qr_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }

    async fn add_event_handler(&self, handler: EventHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    async fn set_proxy(&self, url: &str) -> Result<()> {
        *self
            .inner
            .proxy
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(url.to_string());
        Ok(())
    }

    async fn send_message(&self, to: &Jid, content: OutgoingContent) -> Result<SendResponse> {
        if !self.is_connected() || !self.is_logged_in() {
            return Err(UpstreamError::Send("not connected".into()).into());
        }
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to.clone(), content));
        tracing::debug!(session = %self.inner.session, to = %to, "stub send accepted");
        Ok(SendResponse {
            id: Self::generate_message_id(),
            timestamp: Utc::now(),
        })
    }
}

/// Factory for [StubClient]s. Keeps every client it built so tests can
/// reach into a session's backend.
pub struct StubFactory {
    devices: Arc<dyn DeviceStore>,
    clients: Mutex<HashMap<String, Arc<StubClient>>>,
}

impl StubFactory {
    pub fn new(devices: Arc<dyn DeviceStore>) -> Self {
        Self {
            devices,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The most recent client built for `session`, if any.
    pub fn client_for(&self, session: &str) -> Option<Arc<StubClient>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .cloned()
    }
}

#[async_trait]
impl ProtocolFactory for StubFactory {
    async fn client(
        &self,
        session: &str,
        device: Option<DeviceIdentity>,
    ) -> Result<Arc<dyn ProtocolClient>> {
        let client = Arc::new(StubClient::new(session, device, Arc::clone(&self.devices)));
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.to_string(), Arc::clone(&client));
        Ok(client)
    }
}
