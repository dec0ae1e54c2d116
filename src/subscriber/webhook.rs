//! Webhook bridge: transforms session events into HTTP POSTs.

use super::{DeliveryContext, EventSubscriber};
use crate::types::{Event, QrCodeEvent};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Forwards every event to a configured endpoint as JSON. When a secret
/// is set, the body is signed with HMAC-SHA256 and the hex tag is sent in
/// `X-Webhook-Signature`.
pub struct WebhookBridge {
    http: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookBridge {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            secret,
        }
    }

    fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait::async_trait]
impl EventSubscriber for WebhookBridge {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
        // QR events use the dedicated payload shape subscribers validate
        // against; everything else ships the tagged event as-is.
        let payload = match event {
            Event::Qr { code, expires_at } => serde_json::to_value(QrCodeEvent {
                session_name: ctx.session_name.clone(),
                qr_code: code.clone(),
                expires_at: *expires_at,
            })?,
            other => serde_json::to_value(other)?,
        };
        let body = serde_json::to_vec(&serde_json::json!({
            "session_name": ctx.session_name,
            "session_id": ctx.session_id,
            "event": event.kind(),
            "payload": payload,
        }))?;

        let mut req = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(signature) = self.sign(&body) {
            req = req.header("X-Webhook-Signature", signature);
        }

        let resp = req.body(body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook endpoint returned {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let bridge = WebhookBridge::new("http://localhost/hook", Some("topsecret".into()));
        let a = bridge.sign(b"{\"x\":1}").unwrap();
        let b = bridge.sign(b"{\"x\":1}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn no_secret_means_no_signature() {
        let bridge = WebhookBridge::new("http://localhost/hook", None);
        assert!(bridge.sign(b"body").is_none());
    }
}
