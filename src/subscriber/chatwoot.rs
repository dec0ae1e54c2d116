//! Helpdesk bridge: mirrors inbound messages into a Chatwoot inbox.

use super::{DeliveryContext, EventSubscriber};
use crate::store::{MessageStore, SyncStatus};
use crate::types::{Event, MessageContent};
use std::sync::Arc;

/// Receives message events only. After each delivery attempt the mirrored
/// message record's sync status is updated to `synced` or `failed`.
pub struct ChatwootBridge {
    http: reqwest::Client,
    base_url: String,
    token: String,
    messages: Arc<dyn MessageStore>,
}

impl ChatwootBridge {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            messages,
        }
    }

    fn preview(content: &MessageContent) -> String {
        match content {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Media { kind, caption, .. } => caption
                .clone()
                .unwrap_or_else(|| format!("[{}]", kind.as_str())),
            MessageContent::Location { latitude, longitude, .. } => {
                format!("[location {latitude},{longitude}]")
            }
            MessageContent::Contact { display_name, .. } => format!("[contact {display_name}]"),
            MessageContent::Unknown { .. } => "[unsupported message]".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl EventSubscriber for ChatwootBridge {
    fn name(&self) -> &'static str {
        "chatwoot"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::Message(_))
    }

    async fn deliver(&self, ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
        let Event::Message(msg) = event else {
            return Ok(());
        };

        let result = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("api_access_token", &self.token)
            .json(&serde_json::json!({
                "session": ctx.session_name,
                "sender": msg.from.to_string(),
                "chat": msg.chat.to_string(),
                "content": Self::preview(&msg.content),
                "source_id": msg.id,
            }))
            .send()
            .await;

        let ok = matches!(&result, Ok(resp) if resp.status().is_success());
        let sync = if ok { SyncStatus::Synced } else { SyncStatus::Failed };
        if let Some(rec) = self.messages.get_message(ctx.session_id, &msg.id).await? {
            self.messages.update_message_sync(rec.id, sync).await?;
        }

        match result {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => anyhow::bail!("chatwoot returned {}", resp.status()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    #[test]
    fn preview_extracts_text_and_placeholders() {
        assert_eq!(
            ChatwootBridge::preview(&MessageContent::Text { body: "hi".into() }),
            "hi"
        );
        assert_eq!(
            ChatwootBridge::preview(&MessageContent::Media {
                kind: MediaKind::Image,
                mime_type: "image/jpeg".into(),
                caption: Some("look".into()),
                url: None,
            }),
            "look"
        );
        assert_eq!(
            ChatwootBridge::preview(&MessageContent::Contact {
                display_name: "Ada".into(),
                vcard: "BEGIN:VCARD".into(),
            }),
            "[contact Ada]"
        );
    }
}
