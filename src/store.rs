//! Generation-tagged instance cache.
//!
//! Instances are keyed by `(scope, name)`. Each entry remembers the store
//! generation it was created under; looking it up after the generation moved
//! on replaces it and hands the old instance to the dispose hook on a
//! background task. An entry replaced while its creation is still running is
//! disposed as soon as that creation finishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::session::SessionClient;

/// Async cleanup run for instances evicted from an [`InstanceStore`].
pub type DisposeHook<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

type Key = (String, String);

struct Slot<T> {
    cell: OnceCell<T>,
    evicted: AtomicBool,
    disposed: AtomicBool,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            evicted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Marks the slot evicted and returns its value if it is ready.
    fn evict(&self) -> Option<T> {
        self.evicted.store(true, Ordering::SeqCst);
        self.claim_for_dispose()
    }

    /// Hands out the value of an evicted slot exactly once.
    fn claim_for_dispose(&self) -> Option<T> {
        if !self.evicted.load(Ordering::SeqCst) {
            return None;
        }
        let value = self.cell.get()?.clone();
        if self.disposed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(value)
    }
}

struct Entry<T> {
    generation: u64,
    slot: Arc<Slot<T>>,
}

pub struct InstanceStore<T> {
    generation: AtomicU64,
    entries: Mutex<HashMap<Key, Entry<T>>>,
    dispose: Option<DisposeHook<T>>,
}

impl<T> Default for InstanceStore<T> {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            dispose: None,
        }
    }
}

impl<T> InstanceStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that runs `dispose` on every replaced instance.
    pub fn with_dispose<F, Fut>(dispose: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            dispose: Some(Arc::new(move |value| dispose(value).boxed())),
            ..Self::default()
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidates every cached instance. Entries are replaced, and their
    /// old instances disposed, on their next lookup.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the instance for `(scope, name)`, creating it on a miss.
    ///
    /// Concurrent lookups of the same key share one `create` call. A failed
    /// creation leaves the entry empty, so the next lookup tries again.
    /// Disposal runs on a spawned task, so this must be awaited inside a
    /// tokio runtime.
    pub async fn get_or_try_create<F, Fut, E>(
        &self,
        scope: &str,
        name: &str,
        create: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.generation();
        let (slot, replaced) = {
            let mut entries = self.entries.lock();
            let key = (scope.to_string(), name.to_string());
            match entries.get(&key) {
                Some(entry) if entry.generation == generation => (Arc::clone(&entry.slot), None),
                _ => {
                    let slot = Arc::new(Slot::new());
                    let entry = Entry {
                        generation,
                        slot: Arc::clone(&slot),
                    };
                    (slot, entries.insert(key, entry))
                }
            }
        };

        if let Some(old) = replaced {
            debug!(event = "instance_replaced", scope, name, stale_generation = old.generation);
            if let Some(value) = old.slot.evict() {
                self.spawn_dispose(value);
            }
        }

        let value = slot.cell.get_or_try_init(create).await?.clone();
        // The entry may have been replaced while this creation was running.
        if let Some(stale) = slot.claim_for_dispose() {
            debug!(event = "pending_instance_disposed", scope, name);
            self.spawn_dispose(stale);
        }
        Ok(value)
    }

    /// Drops the entry for `(scope, name)` and disposes its instance.
    ///
    /// A creation still in flight is disposed by the lookup that finishes it.
    pub async fn remove(&self, scope: &str, name: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .remove(&(scope.to_string(), name.to_string()));
        let Some(entry) = removed else {
            return false;
        };
        if let (Some(dispose), Some(value)) = (self.dispose.as_ref(), entry.slot.evict()) {
            dispose(value).await;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn spawn_dispose(&self, value: T) {
        if let Some(dispose) = self.dispose.as_ref() {
            tokio::spawn(dispose(value));
        }
    }
}

/// Store for session clients that disconnects evicted clients.
pub fn session_client_store() -> InstanceStore<SessionClient> {
    InstanceStore::with_dispose(|client: SessionClient| async move {
        client.disconnect().await;
    })
}

/// Returns the connected client for `config.host` in `scope`, creating and
/// connecting one on a miss.
pub async fn lookup_session_client(
    store: &InstanceStore<SessionClient>,
    scope: &str,
    config: ClientConfig,
) -> Result<SessionClient, SessionError> {
    let name = config.host.clone();
    store
        .get_or_try_create(scope, &name, || async move {
            let client = SessionClient::new(config)?;
            client.connect().await?;
            Ok(client)
        })
        .await
}
