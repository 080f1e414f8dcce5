//! Push-event websocket worker.
//!
//! One worker owns the socket for one live session. It authenticates with the
//! session token, starts the remote event stream once acknowledged, and fans
//! every inbound event out to the current subscribers. Losing the socket is
//! reported back to the client as a fault; an explicit shutdown is not.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, error, info, warn};

use crate::api::{ApiRequest, ApiTransport};
use crate::error::SessionError;
use crate::session::client::{EventCallback, Fault, Inner};
use crate::session::proto::{auth_frame, PushEvent, ResponseEnvelope, SocketFrame};

/// Owner side of a running socket worker. Closing or dropping it shuts the
/// worker down without reporting a fault.
#[derive(Debug)]
pub(crate) struct SocketHandle {
    pub(crate) id: u64,
    shutdown: oneshot::Sender<()>,
}

impl SocketHandle {
    pub(crate) fn close(self) {
        let _ = self.shutdown.send(());
    }
}

enum SocketOutcome {
    Shutdown,
    Lost(&'static str),
}

pub(crate) fn spawn_socket(
    runtime: &tokio::runtime::Handle,
    inner: &Arc<Inner>,
    session_id: SecretString,
    epoch: u64,
    id: u64,
) -> SocketHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let weak = Arc::downgrade(inner);
    let url = inner.config.socket_url();
    let reject_unauthorized = inner.config.reject_unauthorized;
    let transport = inner.transport.clone();

    runtime.spawn(async move {
        let outcome = run_socket(
            &url,
            reject_unauthorized,
            &session_id,
            &transport,
            &weak,
            shutdown_rx,
        )
        .await;

        let reason = match outcome {
            Ok(SocketOutcome::Shutdown) => {
                debug!(event = "socket_closed", socket_id = id);
                return;
            }
            Ok(SocketOutcome::Lost(reason)) => reason.to_string(),
            Err(err) => err.to_string(),
        };

        warn!(event = "socket_lost", socket_id = id, reason = %reason);
        if let Some(inner) = weak.upgrade() {
            inner.handle_fault(Fault::Socket {
                epoch,
                socket_id: id,
            });
        }
    });

    SocketHandle {
        id,
        shutdown: shutdown_tx,
    }
}

async fn run_socket(
    url: &str,
    reject_unauthorized: bool,
    session_id: &SecretString,
    transport: &ApiTransport,
    inner: &Weak<Inner>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<SocketOutcome, SessionError> {
    let request = url.into_client_request()?;
    let connector = connector_for(url, reject_unauthorized)?;

    let (mut socket, _) = tokio::select! {
        _ = &mut shutdown_rx => return Ok(SocketOutcome::Shutdown),
        connected = connect_async_tls_with_config(request, None, false, connector) => connected?,
    };

    socket
        .send(Message::Text(auth_frame(session_id.expose_secret())))
        .await?;
    debug!(event = "socket_opened");

    let mut started = false;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let _ = socket.close(None).await;
                return Ok(SocketOutcome::Shutdown);
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match SocketFrame::from_text(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(event = "socket_frame_invalid", error = %err);
                                continue;
                            }
                        };
                        let event = match frame {
                            SocketFrame::Ack(envelope) if !started => {
                                if !envelope.is_success() {
                                    return Err(SessionError::Protocol(format!(
                                        "socket authentication rejected with code {}",
                                        envelope.response.code
                                    )));
                                }
                                start_event_stream(transport, session_id).await?;
                                started = true;
                                info!(event = "event_stream_started");
                                continue;
                            }
                            SocketFrame::Ack(envelope) => PushEvent::new(serde_json::to_value(envelope)?),
                            SocketFrame::Event(event) => event,
                        };

                        let Some(inner) = inner.upgrade() else {
                            let _ = socket.close(None).await;
                            return Ok(SocketOutcome::Shutdown);
                        };
                        let subscribers = inner.subscriber_snapshot();
                        drop(inner);
                        fan_out(&subscribers, &event);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return Ok(SocketOutcome::Lost("failed to answer ping"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => return Ok(SocketOutcome::Lost("closed by remote")),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(SessionError::WebSocket(err)),
                    None => return Ok(SocketOutcome::Lost("socket stream ended")),
                }
            }
        }
    }
}

async fn start_event_stream(
    transport: &ApiTransport,
    session_id: &SecretString,
) -> Result<(), SessionError> {
    let envelope = transport
        .send(session_id, ApiRequest::<ResponseEnvelope>::post("/events/start"))
        .await?;

    if !envelope.is_success() {
        return Err(SessionError::Protocol(format!(
            "failure to start events: code {}",
            envelope.response.code
        )));
    }
    Ok(())
}

fn connector_for(url: &str, reject_unauthorized: bool) -> Result<Option<Connector>, SessionError> {
    if !url.starts_with("wss://") {
        return Ok(Some(Connector::Plain));
    }

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!reject_unauthorized)
        .danger_accept_invalid_hostnames(!reject_unauthorized)
        .build()?;
    Ok(Some(Connector::NativeTls(tls)))
}

/// Delivers `event` to every subscriber in registration order.
///
/// A panicking subscriber is logged and skipped.
pub(crate) fn fan_out(subscribers: &[EventCallback], event: &PushEvent) {
    for (index, callback) in subscribers.iter().enumerate() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
            error!(
                event = "subscriber_panicked",
                index,
                message = %panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
