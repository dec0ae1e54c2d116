//! Protocol Client capability.
//!
//! The wire protocol (framing, Noise handshake, pairing cryptography) is
//! a linked library behind these traits; the engine only drives the
//! lifecycle. The in-crate [stub] backend implements the same surface
//! in-process for development and tests.

mod stub;

pub use stub::{StubClient, StubFactory};

use crate::store::DeviceIdentity;
use crate::types::{Event, Jid, MediaKind, MessageId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One event on the QR pairing stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QrEvent {
    /// Fresh pairing code to display.
    Code { code: String },
    /// The protocol gave up rotating codes.
    Timeout,
}

/// Stream of QR events for one pairing attempt.
pub type QrChannel = mpsc::Receiver<QrEvent>;

/// Handler invoked inline for every protocol event. Keep it cheap: the
/// dispatcher only forwards into its own channel.
pub type EventHandler = Box<dyn Fn(Event) + Send + Sync>;

/// Response from sending a message.
#[derive(Clone, Debug)]
pub struct SendResponse {
    /// Remote message id.
    pub id: MessageId,
    /// Protocol-reported send timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Outbound payload for the minimal send surface.
#[derive(Clone, Debug)]
pub enum OutgoingContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        mime_type: String,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
}

/// One authenticated protocol connection bound to one device identity.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Initiate the connection. For an unpaired device the QR stream
    /// (opened first via [qr_channel](Self::qr_channel)) starts yielding codes.
    async fn connect(&self) -> Result<()>;

    /// Tear down the connection. Does not touch the device identity.
    async fn disconnect(&self);

    /// Unlink the device remotely and erase its stored identity.
    async fn logout(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    /// Device JID from the client's store; `None` until paired.
    fn device_jid(&self) -> Option<Jid>;

    /// Open the QR stream for an unpaired device. Must be called before
    /// [connect](Self::connect).
    async fn qr_channel(&self) -> Result<QrChannel>;

    /// Register a handler for every event this client emits.
    async fn add_event_handler(&self, handler: EventHandler);

    /// Route traffic through the given proxy URL.
    async fn set_proxy(&self, url: &str) -> Result<()>;

    async fn send_message(&self, to: &Jid, content: OutgoingContent) -> Result<SendResponse>;
}

/// Builds protocol clients bound to a session name and an optional
/// previously stored device identity. One factory per process.
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    async fn client(
        &self,
        session: &str,
        device: Option<DeviceIdentity>,
    ) -> Result<Arc<dyn ProtocolClient>>;
}
