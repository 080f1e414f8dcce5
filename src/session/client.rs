//! Session client with keep-alive probing, push-event subscriptions and
//! automatic reconnection.
//!
//! A [`SessionClient`] holds at most one live session, one push-event socket
//! and one keep-alive timer. Runtime faults on the socket or the keep-alive
//! probe move the client into [`ConnectionState::Reconnecting`], where it
//! retries login with a fixed delay until it succeeds or `disconnect` is
//! called.
//!
//! Every state transition bumps an internal epoch. Background tasks carry the
//! epoch they were started under, so faults and reconnection results from a
//! superseded session are ignored.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use secrecy::SecretString;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, ApiTransport};
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::retry::{retry_with_fixed_delay, ReconnectPolicy};
use crate::session::proto::PushEvent;
use crate::session::socket::{spawn_socket, SocketHandle};

/// Callback receiving push events.
pub type EventCallback = Arc<dyn Fn(&PushEvent) + Send + Sync>;
/// Callback invoked after every successful connect or reconnect.
pub type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;

const KEEP_ALIVE_PROBE_PATH: &str = "/users?limit=1";

/// Lifecycle of a [`SessionClient`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Builder for [`SessionClient`].
pub struct SessionClientBuilder {
    config: ClientConfig,
    on_connected: Option<ConnectedCallback>,
}

impl SessionClientBuilder {
    /// Sets the callback run after each successful connect, once the socket
    /// and keep-alive are set up.
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<SessionClient, SessionError> {
        let transport = ApiTransport::new(&self.config)?;
        Ok(SessionClient {
            inner: Arc::new(Inner {
                config: self.config,
                transport,
                on_connected: self.on_connected,
                state: Mutex::new(State::default()),
            }),
        })
    }
}

/// Cloneable handle to one remote session.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Result<Self, SessionError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> SessionClientBuilder {
        SessionClientBuilder {
            config,
            on_connected: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Logs in with the configured credentials.
    ///
    /// Opens the push-event socket when subscribers are already registered
    /// and starts keep-alive when configured. Fails with
    /// [`SessionError::AlreadyConnected`] unless the client is disconnected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let epoch = {
            let mut state = self.inner.state.lock();
            if state.phase != ConnectionState::Disconnected {
                return Err(SessionError::AlreadyConnected);
            }
            state.epoch += 1;
            state.phase = ConnectionState::Connecting;
            state.runtime = Some(Handle::current());
            state.epoch
        };
        let _pending = PendingConnect {
            inner: &self.inner,
            epoch,
        };

        let config = &self.inner.config;
        match self
            .inner
            .transport
            .login(&config.login_id, &config.password)
            .await
        {
            Ok(session_id) => {
                self.inner
                    .establish(session_id, ConnectionState::Connecting, epoch)
            }
            Err(err) => {
                warn!(event = "login_failed", host = %config.host, error = %err);
                Err(err)
            }
        }
    }

    /// Stops keep-alive, closes the socket and logs out.
    ///
    /// Logout failures are swallowed. Also cancels a running reconnection
    /// loop. Subscriber registrations are kept for the next `connect`.
    pub async fn disconnect(&self) {
        let session_id = {
            let mut state = self.inner.state.lock();
            if state.phase == ConnectionState::Disconnected {
                return;
            }
            state.epoch += 1;
            state.phase = ConnectionState::Disconnected;
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            state.teardown()
        };

        info!(event = "session_disconnected", host = %self.inner.config.host);
        if let Some(session_id) = session_id {
            self.inner.logout_best_effort(&session_id).await;
        }
    }

    /// Issues one authenticated call.
    ///
    /// Fails with an authentication error, without touching the network, when
    /// no session is held.
    pub async fn request<T>(&self, request: ApiRequest<T>) -> Result<T, SessionError> {
        let session_id = self
            .inner
            .state
            .lock()
            .session_id
            .clone()
            .ok_or_else(SessionError::unauthorized)?;
        self.inner.transport.send(&session_id, request).await
    }

    /// Registers a push-event callback.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.subscribe_shared(Arc::new(callback))
    }

    /// Registers an already shared callback. Registering the same callback
    /// twice yields two independent subscriptions.
    pub fn subscribe_shared(&self, callback: EventCallback) -> Subscription {
        let mut state = self.inner.state.lock();
        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        state.subscribers.push(Subscriber { id, callback });
        state.open_socket_if_needed(&self.inner);

        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// True iff a session token is held. False while reconnecting.
    pub fn connected(&self) -> bool {
        self.inner.state.lock().session_id.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// True iff the push-event socket worker is running.
    pub fn listening(&self) -> bool {
        self.inner.state.lock().socket.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SessionClient")
            .field("host", &self.inner.config.host)
            .field("state", &state.phase)
            .field("subscribers", &state.subscribers.len())
            .field("listening", &state.socket.is_some())
            .finish()
    }
}

/// Registration returned by [`SessionClient::subscribe`].
///
/// Dropping it leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the callback registered"]
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Removes exactly this registration. Closes the push-event socket when
    /// no subscribers remain.
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if let Some(index) = state.subscribers.iter().position(|s| s.id == self.id) {
            state.subscribers.remove(index);
        }
        if state.subscribers.is_empty() {
            if let Some(socket) = state.socket.take() {
                debug!(event = "socket_stop_listening", socket_id = socket.id);
                socket.close();
            }
        }
    }
}

struct Subscriber {
    id: u64,
    callback: EventCallback,
}

/// Background fault reported by a task of the session tagged `epoch`.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Fault {
    Socket { epoch: u64, socket_id: u64 },
    KeepAlive { epoch: u64 },
}

#[derive(Default)]
struct State {
    phase: ConnectionState,
    epoch: u64,
    session_id: Option<SecretString>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    next_socket_id: u64,
    socket: Option<SocketHandle>,
    keep_alive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

impl State {
    /// Stops keep-alive and the socket, returning the released session token.
    fn teardown(&mut self) -> Option<SecretString> {
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.abort();
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.session_id.take()
    }

    fn open_socket_if_needed(&mut self, inner: &Arc<Inner>) {
        if self.socket.is_some()
            || self.subscribers.is_empty()
            || self.phase != ConnectionState::Connected
        {
            return;
        }
        let (Some(session_id), Some(runtime)) = (self.session_id.clone(), self.runtime.clone())
        else {
            return;
        };

        self.next_socket_id += 1;
        let socket = spawn_socket(&runtime, inner, session_id, self.epoch, self.next_socket_id);
        debug!(event = "socket_start_listening", socket_id = socket.id);
        self.socket = Some(socket);
    }
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: ApiTransport,
    on_connected: Option<ConnectedCallback>,
    state: Mutex<State>,
}

impl Inner {
    pub(crate) fn subscriber_snapshot(&self) -> Vec<EventCallback> {
        self.state
            .lock()
            .subscribers
            .iter()
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect()
    }

    /// Installs a freshly logged-in session if the client is still in
    /// `expected` phase at `epoch`; otherwise the session is logged out again.
    fn establish(
        self: &Arc<Self>,
        session_id: SecretString,
        expected: ConnectionState,
        epoch: u64,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.phase != expected || state.epoch != epoch {
                drop(state);
                debug!(event = "stale_login_discarded");
                self.spawn_logout(session_id);
                return Err(SessionError::Cancelled);
            }

            state.epoch += 1;
            state.phase = ConnectionState::Connected;
            state.session_id = Some(session_id.clone());
            state.reconnect = None;
            state.open_socket_if_needed(self);
            if let Some(interval) = self.config.keep_alive_period() {
                state.keep_alive = Some(spawn_keep_alive(self, session_id, state.epoch, interval));
            }
        }

        info!(event = "session_connected", host = %self.config.host);
        if let Some(on_connected) = self.on_connected.as_ref() {
            on_connected();
        }
        Ok(())
    }

    /// Moves a connected client into the reconnection loop.
    ///
    /// Faults from superseded sessions or sockets are ignored, so one fault
    /// starts at most one reconnection cycle.
    pub(crate) fn handle_fault(self: &Arc<Self>, fault: Fault) {
        let mut state = self.state.lock();
        let current = match fault {
            Fault::Socket { epoch, socket_id } => {
                state.epoch == epoch
                    && state
                        .socket
                        .as_ref()
                        .is_some_and(|socket| socket.id == socket_id)
            }
            Fault::KeepAlive { epoch } => state.epoch == epoch && state.keep_alive.is_some(),
        };
        if state.phase != ConnectionState::Connected || !current {
            debug!(event = "stale_fault_ignored", fault = ?fault);
            return;
        }

        warn!(event = "session_lost", fault = ?fault, host = %self.config.host);
        state.epoch += 1;
        state.phase = ConnectionState::Reconnecting;
        let stale_session = state.teardown();
        let epoch = state.epoch;
        state.reconnect = Some(spawn_reconnect(self, stale_session, epoch));
    }

    fn is_reconnecting(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.phase == ConnectionState::Reconnecting && state.epoch == epoch
    }

    async fn logout_best_effort(&self, session_id: &SecretString) {
        if let Err(err) = self.transport.logout(session_id).await {
            debug!(event = "logout_failed", error = %err);
        }
    }

    fn spawn_logout(&self, session_id: SecretString) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.logout(&session_id).await {
                debug!(event = "logout_failed", error = %err);
            }
        });
    }
}

/// Resets a `Connecting` client when the connect call fails or is dropped.
struct PendingConnect<'a> {
    inner: &'a Inner,
    epoch: u64,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.phase == ConnectionState::Connecting && state.epoch == self.epoch {
            state.phase = ConnectionState::Disconnected;
        }
    }
}

fn keep_alive_probe() -> ApiRequest<()> {
    ApiRequest::with_result_mapper(Method::GET, KEEP_ALIVE_PROBE_PATH, |_| Ok(()))
}

/// Probes the session every `interval`. The next probe is scheduled only
/// after the previous one succeeded; a failed probe reports a fault and ends
/// the task.
fn spawn_keep_alive(
    inner: &Arc<Inner>,
    session_id: SecretString,
    epoch: u64,
    interval: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            debug!(event = "keep_alive_probe");
            if let Err(err) = inner.transport.send(&session_id, keep_alive_probe()).await {
                warn!(event = "keep_alive_failed", error = %err);
                inner.handle_fault(Fault::KeepAlive { epoch });
                return;
            }
        }
    })
}

/// Logs out the lost session, then retries login with a fixed delay until it
/// succeeds or the client leaves the `Reconnecting` phase at `epoch`.
fn spawn_reconnect(
    inner: &Arc<Inner>,
    stale_session: Option<SecretString>,
    epoch: u64,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let policy = ReconnectPolicy::fixed(inner.config.reconnect_delay);

    tokio::spawn(async move {
        if let Some(session_id) = stale_session {
            if let Some(inner) = weak.upgrade() {
                inner.logout_best_effort(&session_id).await;
            }
        }

        let is_live = {
            let weak = weak.clone();
            move || {
                weak.upgrade()
                    .is_some_and(|inner| inner.is_reconnecting(epoch))
            }
        };

        let reconnected = retry_with_fixed_delay(&policy, is_live, |attempt| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or(SessionError::Cancelled)?;
                debug!(event = "reconnect_attempt", attempt);
                let session_id = inner
                    .transport
                    .login(&inner.config.login_id, &inner.config.password)
                    .await?;
                inner.establish(session_id, ConnectionState::Reconnecting, epoch)
            }
        })
        .await;

        if reconnected.is_some() {
            info!(event = "session_reconnected");
        }
    })
}
