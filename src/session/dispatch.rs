//! Per-session event dispatcher.
//!
//! Receives every protocol event for one handle, in emission order:
//! classifies it, upserts durable session state, mirrors inbound messages
//! (deduplicated per session by remote id), then fans out to subscribers.
//! Each step is an independent idempotent upsert; a storage failure is
//! logged and never poisons the pipeline.

use super::handle::SessionHandle;
use crate::store::{MessageRecord, MessageStore, SessionStore, SyncStatus};
use crate::types::{Event, Jid, SessionStatus};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Spawn the dispatcher task for a handle. Ends when the handle scope is
/// cancelled or the event channel closes.
pub(crate) fn spawn(handle: Arc<SessionHandle>, mut rx: mpsc::UnboundedReceiver<Event>) {
    tokio::spawn(async move {
        let scope = handle.scope().clone();
        loop {
            let event = tokio::select! {
                _ = scope.cancelled() => break,
                evt = rx.recv() => match evt {
                    Some(evt) => evt,
                    None => break,
                },
            };

            let fan_out = match AssertUnwindSafe(process(&handle, &event)).catch_unwind().await {
                Ok(fan_out) => fan_out,
                Err(_) => {
                    tracing::error!(
                        session = %handle.name(),
                        event = event.kind(),
                        "event dispatcher panicked; continuing with next event"
                    );
                    continue;
                }
            };
            if fan_out {
                handle.fanout().publish(&event);
            }
        }
    });
}

/// Apply one event to durable state. Returns whether the event should be
/// fanned out (duplicate messages are swallowed).
async fn process(handle: &Arc<SessionHandle>, event: &Event) -> bool {
    match event {
        Event::Connected => {
            handle
                .set_status_persisted(SessionStatus::Connected, None)
                .await;
            true
        }
        Event::Disconnected { reason } => {
            handle
                .set_status_persisted(SessionStatus::Disconnected, reason.as_deref())
                .await;
            true
        }
        Event::LoggedOut { reason } => {
            // The device JID stays on the record; only an explicit logout
            // call erases it.
            tracing::info!(
                session = %handle.name(),
                reason = reason.as_deref().unwrap_or("unknown"),
                "session logged out"
            );
            handle
                .set_status_persisted(SessionStatus::LoggedOut, None)
                .await;
            true
        }
        Event::PairSuccess { jid } => {
            pair_success(handle, jid).await;
            true
        }
        Event::PairError { error } => {
            handle.cancel_pairing();
            handle.clear_qr_persisted().await;
            handle
                .set_status_persisted(SessionStatus::PairError, Some(error))
                .await;
            true
        }
        Event::Qr { code, expires_at } => {
            handle.set_qr_persisted(code.clone(), *expires_at).await;
            handle
                .set_status_persisted(SessionStatus::QrCode, None)
                .await;
            true
        }
        Event::Message(msg) => mirror_message(handle, msg).await,
        Event::Unknown { kind } => {
            tracing::debug!(session = %handle.name(), kind = %kind, "ignoring unrecognized event");
            true
        }
    }
}

async fn pair_success(handle: &Arc<SessionHandle>, jid: &Jid) {
    handle.cancel_pairing();

    let existing = match handle.store().get_session_by_id(handle.id()).await {
        Ok(rec) => rec.and_then(|r| r.device_jid),
        Err(e) => {
            tracing::error!(session = %handle.name(), error = %e, "failed to load record on pair success");
            None
        }
    };
    if let Some(existing) = existing {
        if existing != *jid {
            tracing::warn!(
                session = %handle.name(),
                existing = %existing,
                paired = %jid,
                "pair success for a different device than the stored identity; rejecting"
            );
            handle
                .set_status_persisted(
                    SessionStatus::PairError,
                    Some("pairing produced a conflicting device identity"),
                )
                .await;
            return;
        }
    }

    handle.clear_qr_persisted().await;
    if let Err(e) = handle
        .store()
        .set_session_device_jid(handle.id(), Some(jid))
        .await
    {
        tracing::error!(session = %handle.name(), error = %e, "failed to persist device jid");
    }
    handle
        .set_status_persisted(SessionStatus::LoggedIn, None)
        .await;
    tracing::info!(session = %handle.name(), device = %jid, "paired");
}

/// Mirror an inbound message. Returns false for duplicates so they are
/// not re-delivered to subscribers.
async fn mirror_message(handle: &Arc<SessionHandle>, msg: &crate::types::MessageEvent) -> bool {
    let payload = match serde_json::to_value(&msg.content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(session = %handle.name(), error = %e, "failed to serialize message payload");
            serde_json::Value::Null
        }
    };
    let record = MessageRecord {
        id: Uuid::new_v4(),
        session_id: handle.id(),
        remote_id: msg.id.clone(),
        sender: msg.from.clone(),
        chat: msg.chat.clone(),
        from_me: msg.is_from_me,
        msg_type: msg.content.type_tag().to_string(),
        timestamp: msg.timestamp,
        payload,
        sync_status: SyncStatus::Pending,
    };

    let inserted = match handle.store().insert_message(&record).await {
        Ok(inserted) => inserted,
        Err(e) => {
            tracing::error!(session = %handle.name(), error = %e, "failed to mirror message");
            // Deliver anyway; storage converges independently.
            true
        }
    };
    if !inserted {
        tracing::debug!(
            session = %handle.name(),
            remote_id = %msg.id,
            "duplicate message skipped"
        );
        return false;
    }

    let now = Utc::now();
    handle.touch(now);
    if let Err(e) = handle.store().touch_session(handle.id(), now).await {
        tracing::warn!(session = %handle.name(), error = %e, "failed to touch last-seen");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolFactory, StubFactory};
    use crate::store::{MemoryStore, MessageStore, SessionRecord, SessionStore, Store};
    use crate::types::{MessageContent, MessageEvent};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn wired() -> (Arc<SessionHandle>, Arc<crate::protocol::StubClient>, Store) {
        let mem = Arc::new(MemoryStore::new());
        let store: Store = mem.clone();
        let factory = StubFactory::new(mem);
        let record = SessionRecord::new("d");
        store.create_session(&record).await.unwrap();
        let client = factory.client("d", None).await.unwrap();
        let handle = SessionHandle::new(
            &record,
            client,
            Arc::clone(&store),
            CancellationToken::new(),
            &[],
        )
        .await;
        (handle, factory.client_for("d").unwrap(), store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn text(id: &str) -> MessageEvent {
        MessageEvent {
            id: id.to_string(),
            from: Jid::new("100", "s.whatsapp.net"),
            chat: Jid::new("100", "s.whatsapp.net"),
            timestamp: Utc::now(),
            is_from_me: false,
            content: MessageContent::Text { body: "hi".into() },
        }
    }

    #[tokio::test]
    async fn connected_event_updates_record() {
        let (handle, stub, store) = wired().await;
        stub.emit(Event::Connected);
        settle().await;
        assert_eq!(handle.status(), SessionStatus::Connected);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert!(rec.connected);
        assert!(rec.connected_at.is_some());
        assert!(rec.connection_error.is_none());
    }

    #[tokio::test]
    async fn disconnect_event_records_reason() {
        let (handle, stub, store) = wired().await;
        stub.emit(Event::Connected);
        stub.emit(Event::Disconnected {
            reason: Some("stream error".into()),
        });
        settle().await;
        assert_eq!(handle.status(), SessionStatus::Disconnected);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert!(!rec.connected);
        assert_eq!(rec.connection_error.as_deref(), Some("stream error"));
    }

    #[tokio::test]
    async fn pair_success_sets_device_jid_and_clears_qr() {
        let (handle, stub, store) = wired().await;
        stub.emit(Event::Qr {
            code: "2@first".into(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        });
        settle().await;
        assert_eq!(handle.status(), SessionStatus::QrCode);

        let jid = Jid::new_ad("15551234567", 0, 0);
        stub.emit(Event::PairSuccess { jid: jid.clone() });
        settle().await;
        assert_eq!(handle.status(), SessionStatus::LoggedIn);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert_eq!(rec.device_jid, Some(jid));
        assert!(rec.qr_code.is_none());
    }

    #[tokio::test]
    async fn conflicting_pair_success_is_rejected() {
        let (handle, stub, store) = wired().await;
        let original = Jid::new_ad("15551234567", 0, 0);
        store
            .set_session_device_jid(handle.id(), Some(&original))
            .await
            .unwrap();

        stub.emit(Event::PairSuccess {
            jid: Jid::new_ad("19998887777", 0, 0),
        });
        settle().await;
        assert_eq!(handle.status(), SessionStatus::PairError);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert_eq!(rec.device_jid, Some(original));
    }

    #[tokio::test]
    async fn duplicate_messages_are_stored_once() {
        let (handle, stub, store) = wired().await;
        stub.emit(Event::Message(text("3EB0DUP")));
        stub.emit(Event::Message(text("3EB0DUP")));
        stub.emit(Event::Message(text("3EB0OTHER")));
        settle().await;
        assert_eq!(store.count_messages(handle.id()).await.unwrap(), 2);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert!(rec.last_seen.is_some());
    }

    #[tokio::test]
    async fn logged_out_keeps_device_jid() {
        let (handle, stub, store) = wired().await;
        let jid = Jid::new_ad("15551234567", 0, 0);
        store
            .set_session_device_jid(handle.id(), Some(&jid))
            .await
            .unwrap();
        stub.emit(Event::LoggedOut {
            reason: Some("logged out from phone".into()),
        });
        settle().await;
        assert_eq!(handle.status(), SessionStatus::LoggedOut);
        let rec = store.get_session_by_id(handle.id()).await.unwrap().unwrap();
        assert_eq!(rec.device_jid, Some(jid));
    }
}
