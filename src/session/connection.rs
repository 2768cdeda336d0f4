//! Connection lifecycle
//!
//! The manager owns at most one connection attempt at a time:
//! - `connect()` is memoised. Every caller gets a clone of the same shared
//!   attempt until it fails, the connection is lost, or `disconnect()` runs.
//! - An attempt creates a client with a fresh identifier and registers one
//!   listener, then waits for the handshake (`time()` round-trip) while
//!   watching that listener for a down status. On success the same receiver
//!   is handed to the dispatcher, so nothing queued during the handshake is
//!   lost.
//! - The dispatcher fans message and presence events out to the registry. A
//!   disconnect or network-down status evicts the connection and starts a
//!   supervised reconnect whose outcome is published as a `LifecycleEvent`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{
    ClientEvent, ClientFactory, ClientOptions, ListenerId, MessagingClient, StatusCategory,
};
use crate::session::registry::Registry;
use crate::utils::error::SessionError;

/// A live connection: the client plus the identifier it was created with.
#[derive(Clone)]
pub struct Connection {
    uuid: String,
    client: Arc<dyn MessagingClient>,
}

impl Connection {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uuid", &self.uuid)
            .field("client", &"dyn MessagingClient")
            .finish()
    }
}

/// The shared outcome of one connection attempt.
pub type ConnectAttempt = Shared<BoxFuture<'static, Result<Connection, SessionError>>>;

/// Connection state changes, observable through [`ConnectionManager::lifecycle`].
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected { uuid: String },
    ConnectFailed { error: SessionError },
    ConnectionLost { uuid: String, category: StatusCategory },
    Reconnected { uuid: String },
    ReconnectFailed { error: SessionError },
}

struct Cached {
    generation: u64,
    attempt: ConnectAttempt,
}

struct Inner {
    factory: Arc<dyn ClientFactory>,
    options: ClientOptions,
    handshake_timeout: Option<Duration>,
    registry: Arc<Registry>,
    cached: Mutex<Option<Cached>>,
    generation: AtomicU64,
    active_listener: Mutex<Option<(Arc<dyn MessagingClient>, ListenerId)>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl Inner {
    fn cached(&self) -> MutexGuard<'_, Option<Cached>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_listener(&self) -> MutexGuard<'_, Option<(Arc<dyn MessagingClient>, ListenerId)>> {
        self.active_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: LifecycleEvent) {
        // no receivers is fine
        let _ = self.lifecycle.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // closing the listener ends the dispatcher task
        if let Some((client, id)) = self.active_listener().take() {
            client.remove_listener(id);
        }
    }
}

/// Creates, caches and replaces the session's single connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    const LIFECYCLE_CAPACITY: usize = 16;

    pub fn new(
        factory: Arc<dyn ClientFactory>,
        options: ClientOptions,
        handshake_timeout: Option<Duration>,
        registry: Arc<Registry>,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(Self::LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                handshake_timeout,
                registry,
                cached: Mutex::new(None),
                generation: AtomicU64::new(0),
                active_listener: Mutex::new(None),
                lifecycle,
            }),
        }
    }

    /// Returns the cached attempt, starting a new one when there is none.
    ///
    /// The attempt runs on the tokio runtime whether or not it is awaited, so
    /// this must be called from within a runtime.
    pub fn connect(&self) -> ConnectAttempt {
        let mut cached = self.inner.cached();
        if let Some(existing) = cached.as_ref() {
            return existing.attempt.clone();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let attempt = self.begin(generation);
        *cached = Some(Cached {
            generation,
            attempt: attempt.clone(),
        });
        attempt
    }

    /// Stops the current connection's client.
    ///
    /// The attempt is evicted first, so the stop is not treated as a lost
    /// connection and the next `connect()` starts over.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let attempt = self.connect();
        let connection = attempt.clone().await?;

        {
            let mut cached = self.inner.cached();
            if cached
                .as_ref()
                .is_some_and(|c| c.attempt.ptr_eq(&attempt))
            {
                cached.take();
            }
        }

        connection.client().stop().await?;
        info!(uuid = connection.uuid(), "Disconnected from messaging service");
        Ok(())
    }

    /// The current connection, if the cached attempt has already succeeded.
    pub fn current(&self) -> Option<Connection> {
        let cached = self.inner.cached();
        cached
            .as_ref()
            .and_then(|c| c.attempt.peek())
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle.subscribe()
    }

    fn begin(&self, generation: u64) -> ConnectAttempt {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let result = manager.establish(generation).await;
            if let Err(err) = &result {
                warn!(error = %err, "Connection attempt failed");
                manager.evict(generation);
                manager.inner.notify(LifecycleEvent::ConnectFailed { error: err.clone() });
            }
            result
        });

        let inner = Arc::downgrade(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    if let Some(inner) = inner.upgrade() {
                        ConnectionManager { inner }.evict(generation);
                    }
                    Err(SessionError::Aborted(join_err.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drops the cached attempt if it still belongs to `generation`.
    fn evict(&self, generation: u64) -> bool {
        let mut cached = self.inner.cached();
        if cached.as_ref().is_some_and(|c| c.generation == generation) {
            cached.take();
            true
        } else {
            false
        }
    }

    async fn establish(&self, generation: u64) -> Result<Connection, SessionError> {
        let uuid = Uuid::new_v4().to_string();
        let options = self.inner.options.with_uuid(uuid.clone());
        info!(uuid = %uuid, generation, "Connecting to messaging service");

        let client = self.inner.factory.create(options)?;

        let (tx, mut events) = mpsc::unbounded_channel();
        let listener = client.add_listener(tx);
        if let Err(err) = self.await_liveness(client.as_ref(), &mut events).await {
            client.remove_listener(listener);
            return Err(err);
        }
        *self.inner.active_listener() = Some((client.clone(), listener));

        tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            self.inner.registry.clone(),
            generation,
            uuid.clone(),
            events,
        ));

        info!(uuid = %uuid, "Connected to messaging service");
        self.inner
            .notify(LifecycleEvent::Connected { uuid: uuid.clone() });
        Ok(Connection { uuid, client })
    }

    async fn await_liveness(
        &self,
        client: &dyn MessagingClient,
        events: &mut UnboundedReceiver<ClientEvent>,
    ) -> Result<(), SessionError> {
        let registry = &self.inner.registry;
        let raced = async {
            tokio::select! {
                // a down status queued alongside the handshake reply wins
                biased;
                err = watch_for_down(events, registry) => Err(err),
                result = handshake(client) => result,
            }
        };

        match self.inner.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, raced)
                .await
                .map_err(|_| SessionError::HandshakeTimeout(limit))?,
            None => raced.await,
        }
    }

    /// Evicts the lost connection and supervises a fresh attempt.
    fn reconnect(&self, generation: u64, uuid: String, category: StatusCategory) {
        if !self.evict(generation) {
            // disconnect() or a newer attempt already replaced it
            debug!(uuid = %uuid, "Stale connection lost, not reconnecting");
            return;
        }
        self.inner
            .notify(LifecycleEvent::ConnectionLost { uuid, category });

        let attempt = self.connect();
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let event = match attempt.await {
                Ok(connection) => {
                    info!(uuid = connection.uuid(), "Reconnected to messaging service");
                    LifecycleEvent::Reconnected {
                        uuid: connection.uuid().to_string(),
                    }
                }
                Err(error) => {
                    error!(error = %error, "Reconnect failed");
                    LifecycleEvent::ReconnectFailed { error }
                }
            };
            if let Some(inner) = inner.upgrade() {
                inner.notify(event);
            }
        });
    }
}

async fn handshake(client: &dyn MessagingClient) -> Result<(), SessionError> {
    match client.time().await {
        Ok(timetoken) => {
            debug!(timetoken, "Handshake succeeded");
            Ok(())
        }
        Err(err) => Err(SessionError::Handshake(err.to_string())),
    }
}

async fn watch_for_down(
    events: &mut UnboundedReceiver<ClientEvent>,
    registry: &Registry,
) -> SessionError {
    while let Some(event) = events.recv().await {
        match &event {
            ClientEvent::Status(status) if status.category.is_down() => {
                return SessionError::NetworkDown(status.category);
            }
            ClientEvent::Status(status) => {
                debug!(category = %status.category, "Status received while connecting");
            }
            _ => registry.dispatch(&event),
        }
    }
    // listener closed: leave the outcome to the handshake
    std::future::pending().await
}

async fn dispatch(
    manager: Weak<Inner>,
    registry: Arc<Registry>,
    generation: u64,
    uuid: String,
    mut events: UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            ClientEvent::Status(status) if status.category.is_down() => {
                warn!(uuid = %uuid, category = %status.category, "Connection lost");
                if let Some(inner) = manager.upgrade() {
                    ConnectionManager { inner }.reconnect(generation, uuid, status.category);
                }
                return;
            }
            ClientEvent::Status(status) => {
                debug!(uuid = %uuid, category = %status.category, "Status event");
            }
            _ => registry.dispatch(&event),
        }
    }
    debug!(uuid = %uuid, "Event listener closed");
}
