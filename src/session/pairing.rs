//! Pairing driver: services the QR handshake for one handle.
//!
//! Consumes the protocol's QR stream and republishes each code through
//! the dispatcher with a fresh expiry. Exits on channel timeout, scope
//! cancellation, or silently when pair-success cancels it from outside.

use super::handle::SessionHandle;
use crate::protocol::{QrChannel, QrEvent};
use crate::types::{qr_validity, Event};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Poll horizon while no code is outstanding; only the channel's own
/// `timeout` event ends the wait in that phase.
const IDLE_HORIZON: Duration = Duration::from_secs(3600);

pub(crate) fn spawn(handle: Arc<SessionHandle>, qr_rx: QrChannel, token: CancellationToken) {
    tokio::spawn(async move {
        let name = handle.name().to_string();
        let run = run(handle, qr_rx, token);
        if AssertUnwindSafe(run).catch_unwind().await.is_err() {
            tracing::error!(session = %name, "pairing driver panicked");
        }
    });
}

async fn run(handle: Arc<SessionHandle>, mut qr_rx: QrChannel, token: CancellationToken) {
    // The QR stream is already open; now initiate the protocol connect
    // that makes it produce codes.
    if let Err(e) = handle.client().connect().await {
        tracing::warn!(session = %handle.name(), error = %e, "connect failed during pairing");
        handle
            .set_status_persisted(crate::types::SessionStatus::Disconnected, Some(&e.to_string()))
            .await;
        return;
    }

    let events = handle.events_tx();
    // Wall-clock expiry of the code currently on screen, if any.
    let mut deadline: Option<Instant> = None;

    loop {
        let expiry = deadline.unwrap_or_else(|| Instant::now() + IDLE_HORIZON);
        tokio::select! {
            _ = token.cancelled() => return,
            evt = qr_rx.recv() => match evt {
                Some(QrEvent::Code { code }) => {
                    deadline = Some(Instant::now() + qr_validity().to_std().unwrap_or(Duration::from_secs(30)));
                    let _ = events.send(Event::Qr {
                        code,
                        expires_at: Utc::now() + qr_validity(),
                    });
                }
                Some(QrEvent::Timeout) => {
                    // Transient: the protocol stopped rotating codes.
                    let _ = events.send(Event::Disconnected {
                        reason: Some("pairing timed out".to_string()),
                    });
                    return;
                }
                None => return,
            },
            _ = tokio::time::sleep_until(expiry) => {
                if deadline.is_some() {
                    // A code was on screen and expired with no successor
                    // and no scan: pairing failed.
                    let _ = events.send(Event::PairError {
                        error: "qr code expired before it was scanned".to_string(),
                    });
                    return;
                }
            }
        }
    }
}
