//! Event subscribers and fan-out.
//!
//! Each session handle owns one [Fanout]. A subscriber gets its own queue
//! and forwarder task, so delivery is FIFO per subscriber and a slow or
//! panicking subscriber cannot stall the dispatcher or its peers.

mod chatwoot;
mod qr_term;
mod webhook;

pub use chatwoot::ChatwootBridge;
pub use qr_term::QrTerminal;
pub use webhook::WebhookBridge;

use crate::types::Event;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Which session an event belongs to.
#[derive(Clone, Debug)]
pub struct DeliveryContext {
    pub session_name: String,
    pub session_id: Uuid,
}

/// A consumer of one session's event stream.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Filtered projection; the default accepts the full sum.
    fn accepts(&self, event: &Event) -> bool {
        let _ = event;
        true
    }

    async fn deliver(&self, ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()>;
}

struct Lane {
    subscriber: Arc<dyn EventSubscriber>,
    tx: mpsc::UnboundedSender<Event>,
}

/// Per-session fan-out over the attached subscribers.
pub struct Fanout {
    ctx: DeliveryContext,
    lanes: Mutex<Vec<Lane>>,
    scope: CancellationToken,
}

impl Fanout {
    pub fn new(session_name: &str, session_id: Uuid, scope: CancellationToken) -> Self {
        Self {
            ctx: DeliveryContext {
                session_name: session_name.to_string(),
                session_id,
            },
            lanes: Mutex::new(Vec::new()),
            scope,
        }
    }

    /// Attach a subscriber and spawn its forwarder. The forwarder ends
    /// when the session scope is cancelled.
    pub fn attach(&self, subscriber: Arc<dyn EventSubscriber>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let ctx = self.ctx.clone();
        let scope = self.scope.clone();
        let sub = Arc::clone(&subscriber);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = scope.cancelled() => break,
                    evt = rx.recv() => match evt {
                        Some(evt) => evt,
                        None => break,
                    },
                };
                let delivery = sub.deliver(&ctx, &event);
                match AssertUnwindSafe(delivery).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            subscriber = sub.name(),
                            session = %ctx.session_name,
                            event = event.kind(),
                            error = %e,
                            "subscriber delivery failed"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            subscriber = sub.name(),
                            session = %ctx.session_name,
                            event = event.kind(),
                            "subscriber panicked"
                        );
                    }
                }
            }
        });
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Lane { subscriber, tx });
    }

    /// Enqueue an event on every accepting lane. Never blocks.
    pub fn publish(&self, event: &Event) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.retain(|lane| {
            if !lane.subscriber.accepts(event) {
                return true;
            }
            lane.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        delay: Duration,
        panic_on: Option<&'static str>,
        count: AtomicUsize,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                delay,
                panic_on: None,
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl EventSubscriber for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn deliver(&self, _ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panic_on == Some(event.kind()) {
                panic!("boom");
            }
            self.seen.lock().unwrap().push(event.kind().to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn msg(id: &str) -> Event {
        Event::Message(crate::types::MessageEvent {
            id: id.to_string(),
            from: crate::types::Jid::new("1", "s.whatsapp.net"),
            chat: crate::types::Jid::new("1", "s.whatsapp.net"),
            timestamp: chrono::Utc::now(),
            is_from_me: false,
            content: crate::types::MessageContent::Text { body: "x".into() },
        })
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_delay_fast_one() {
        let scope = CancellationToken::new();
        let fanout = Fanout::new("s", Uuid::new_v4(), scope.clone());
        let fast = Recorder::new(Duration::ZERO);
        let slow = Recorder::new(Duration::from_millis(200));
        fanout.attach(fast.clone() as Arc<dyn EventSubscriber>);
        fanout.attach(slow.clone() as Arc<dyn EventSubscriber>);

        for i in 0..3 {
            fanout.publish(&msg(&format!("m{i}")));
        }

        // The fast lane drains within a scheduling quantum.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fast.count.load(Ordering::SeqCst), 3);
        assert!(slow.count.load(Ordering::SeqCst) < 3);

        // The slow lane still sees everything, in order.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(slow.count.load(Ordering::SeqCst), 3);
        assert_eq!(*slow.seen.lock().unwrap(), vec!["message", "message", "message"]);

        scope.cancel();
    }

    #[tokio::test]
    async fn panicking_subscriber_keeps_its_lane_alive() {
        let scope = CancellationToken::new();
        let fanout = Fanout::new("s", Uuid::new_v4(), scope.clone());
        let sub = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            panic_on: Some("connected"),
            count: AtomicUsize::new(0),
        });
        fanout.attach(sub.clone() as Arc<dyn EventSubscriber>);

        fanout.publish(&Event::Connected);
        fanout.publish(&msg("after-panic"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*sub.seen.lock().unwrap(), vec!["message"]);
        scope.cancel();
    }

    #[tokio::test]
    async fn filtered_subscriber_skips_events() {
        struct MessagesOnly(Arc<Recorder>);

        #[async_trait::async_trait]
        impl EventSubscriber for MessagesOnly {
            fn name(&self) -> &'static str {
                "messages-only"
            }
            fn accepts(&self, event: &Event) -> bool {
                matches!(event, Event::Message(_))
            }
            async fn deliver(&self, ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
                self.0.deliver(ctx, event).await
            }
        }

        let scope = CancellationToken::new();
        let fanout = Fanout::new("s", Uuid::new_v4(), scope.clone());
        let rec = Recorder::new(Duration::ZERO);
        fanout.attach(Arc::new(MessagesOnly(rec.clone())));

        fanout.publish(&Event::Connected);
        fanout.publish(&msg("m1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*rec.seen.lock().unwrap(), vec!["message"]);
        scope.cancel();
    }
}
