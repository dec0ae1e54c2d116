//! Session lifecycle and event-dispatch engine.
//!
//! One [SessionHandle] per live session, owned by the process-wide
//! [SessionRegistry]. Each handle runs its own state machine, a pairing
//! driver while unpaired, and an event dispatcher that mirrors protocol
//! events into durable state and fans them out to subscribers.

mod dispatch;
mod handle;
mod pairing;
mod registry;
mod restore;

pub use handle::{SendReceipt, SessionHandle, SessionInfo};
pub use registry::SessionRegistry;
