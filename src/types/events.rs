//! Event types emitted by a session's protocol client.
//!
//! The protocol layer emits one untyped stream; the gateway models it as
//! this sum type plus a catch-all for variants it does not recognize
//! (logged and ignored by the dispatcher).

use crate::types::{Jid, MessageId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a QR code stays scannable, in seconds. Fixed by the protocol.
pub const QR_VALIDITY_SECS: i64 = 30;

/// [QR_VALIDITY_SECS] as a [Duration].
pub fn qr_validity() -> Duration {
    Duration::seconds(QR_VALIDITY_SECS)
}

/// Events delivered to the per-session dispatcher and, from there, to
/// subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Socket is up and authenticated at the transport level.
    Connected,

    /// Transport dropped; the protocol client retries on its own.
    Disconnected { reason: Option<String> },

    /// Device was unlinked (remotely or via logout).
    LoggedOut { reason: Option<String> },

    /// QR scan completed; `jid` is the newly assigned device address.
    PairSuccess { jid: Jid },

    /// Pairing failed after the phone responded.
    PairError { error: String },

    /// Fresh pairing code. Emitted by the pairing driver, not the raw
    /// protocol stream.
    Qr { code: String, expires_at: DateTime<Utc> },

    /// Incoming message (decrypted).
    Message(MessageEvent),

    /// Anything the gateway does not model.
    Unknown { kind: String },
}

impl Event {
    /// Short tag for logs and webhook payloads.
    pub fn kind(&self) -> &str {
        match self {
            Event::Connected => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::LoggedOut { .. } => "logged_out",
            Event::PairSuccess { .. } => "pair_success",
            Event::PairError { .. } => "pair_error",
            Event::Qr { .. } => "qr",
            Event::Message(_) => "message",
            Event::Unknown { kind } => kind,
        }
    }
}

/// One decrypted inbound message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Remote (protocol-assigned) message id.
    pub id: MessageId,
    pub from: Jid,
    /// Chat the message belongs to (equals `from` for private chats).
    pub chat: Jid,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub content: MessageContent,
}

/// Typed payload extracted from an inbound message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
    /// Unrecognized variant, stored with a raw dump.
    Unknown {
        raw: serde_json::Value,
    },
}

impl MessageContent {
    /// Type tag persisted on the message record.
    pub fn type_tag(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Media { .. } => "media",
            MessageContent::Location { .. } => "location",
            MessageContent::Contact { .. } => "contact",
            MessageContent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// QR code event as delivered to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QrCodeEvent {
    pub session_name: String,
    pub qr_code: String,
    pub expires_at: DateTime<Utc>,
}

/// Plausibility check a subscriber may apply before rendering a code:
/// one or more leading digits, an `@` separator past position 0 with a
/// payload after it, total length of at least 10.
pub fn is_plausible_qr(code: &str) -> bool {
    if code.len() < 10 {
        return false;
    }
    let Some(at) = code.find('@') else {
        return false;
    };
    if at == 0 || at + 1 >= code.len() {
        return false;
    }
    code[..at].chars().all(|c| c.is_ascii_digit())
}
