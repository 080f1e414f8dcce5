//! Resilient session client for the BioStar 2 access-control API.
//!
//! The crate is organized by concern:
//! - `session`: session lifecycle, push-event socket and auto-reconnect.
//! - `api`: authenticated HTTP calls with pluggable result/error mapping.
//! - `requests`: typed builders for common user and card calls.
//! - `events`: async listener bus fed from a session's push events.
//! - `store`: generation-tagged cache of shared clients.
//! - `config`: connection settings and environment loading.
//! - `retry`: fixed-delay reconnection loop.

/// HTTP request description and transport.
pub mod api;
/// Client configuration and environment overrides.
pub mod config;
/// Error type shared across the crate.
pub mod error;
/// Async push-event dispatch.
pub mod events;
/// Typed request builders.
pub mod requests;
/// Reconnection retry helpers.
pub mod retry;
/// Session client, socket protocol types and lifecycle state.
pub mod session;
/// Generation-tagged instance cache.
pub mod store;

pub use api::ApiRequest;
pub use config::ClientConfig;
pub use error::SessionError;
pub use events::EventBus;
pub use session::{ConnectionState, PushEvent, PushEventKind, SessionClient, Subscription};
