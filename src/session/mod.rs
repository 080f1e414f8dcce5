//! Session modules.
//!
//! - `client`: login lifecycle, subscriptions, keep-alive and reconnection.
//! - `proto`: wire messages shared with the remote service.
//! - `socket`: push-event websocket worker and subscriber fan-out.

/// Session client and subscription handles.
pub mod client;
/// Wire messages and push-event payloads.
pub mod proto;
mod socket;

pub use client::{ConnectionState, SessionClient, SessionClientBuilder, Subscription};
pub use proto::{PushEvent, PushEventKind};
