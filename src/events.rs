//! Typed dispatch of push events to async listeners.
//!
//! The session client hands events to plain synchronous callbacks. An
//! [`EventBus`] sits on top of that: listeners register for one
//! [`PushEventKind`] or for every event, and [`EventBus::forward_from`] feeds
//! the client's events into the bus through one ordered forwarding task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::{PushEvent, PushEventKind, SessionClient, Subscription};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Async listener registered on an [`EventBus`].
pub type EventListener =
    Arc<dyn Fn(PushEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("listener for {kind:?} event failed: {source}")]
pub struct DispatchError {
    pub kind: PushEventKind,
    #[source]
    pub source: BoxError,
}

#[derive(Default)]
struct Listeners {
    by_kind: HashMap<PushEventKind, Vec<EventListener>>,
    wildcard: Vec<EventListener>,
}

/// Cloneable registry of async push-event listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for events of `kind`.
    pub fn listen<F, Fut>(&self, kind: PushEventKind, listener: F)
    where
        F: Fn(PushEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener = boxed_listener(listener);
        self.listeners
            .lock()
            .by_kind
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Registers a listener for every event, run after the kind listeners.
    pub fn listen_all<F, Fut>(&self, listener: F)
    where
        F: Fn(PushEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener = boxed_listener(listener);
        self.listeners.lock().wildcard.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock();
        listeners.by_kind.values().map(Vec::len).sum::<usize>() + listeners.wildcard.len()
    }

    /// Runs the listeners for `event` one after another.
    ///
    /// Listeners for the event's kind run first, then wildcard listeners, in
    /// registration order. The first failing listener ends the dispatch.
    pub async fn dispatch(&self, event: &PushEvent) -> Result<(), DispatchError> {
        let kind = event.kind();
        let targets: Vec<EventListener> = {
            let listeners = self.listeners.lock();
            listeners
                .by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(listeners.wildcard.iter())
                .cloned()
                .collect()
        };

        for listener in targets {
            listener(event.clone())
                .await
                .map_err(|source| DispatchError { kind, source })?;
        }
        Ok(())
    }

    /// Removes every listener.
    pub fn destroy(&self) {
        let mut listeners = self.listeners.lock();
        listeners.by_kind.clear();
        listeners.wildcard.clear();
    }

    /// Subscribes to `client` and dispatches its events on this bus in
    /// arrival order. Must be called from within a tokio runtime.
    ///
    /// Dispatch errors are logged and do not stop forwarding.
    pub fn forward_from(&self, client: &SessionClient) -> EventForwarder {
        let (tx, mut rx) = mpsc::unbounded_channel::<PushEvent>();
        let subscription = client.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });

        let bus = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = bus.dispatch(&event).await {
                    warn!(event = "event_dispatch_failed", error = %err);
                }
            }
            debug!(event = "event_forwarding_stopped");
        });

        EventForwarder { subscription, task }
    }
}

fn boxed_listener<F, Fut>(listener: F) -> EventListener
where
    F: Fn(PushEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |event| listener(event).boxed())
}

/// Running bridge created by [`EventBus::forward_from`].
#[derive(Debug)]
pub struct EventForwarder {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl EventForwarder {
    /// Unsubscribes from the client and waits for queued events to be
    /// dispatched.
    pub async fn stop(self) {
        self.subscription.unsubscribe();
        let _ = self.task.await;
    }
}
