use std::future::Future;
use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::UnsubscribeRequest;
use crate::session::connection::ConnectionManager;
use crate::session::registry::{Registration, Registry};
use crate::utils::error::SessionError;

/// Handle returned by [`Session::subscribe`](super::Session::subscribe).
///
/// Dropping it leaves the handlers registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove them.
#[must_use = "dropping a Subscription keeps its handlers registered"]
pub struct Subscription {
    channel: String,
    handlers: Registration,
    registry: Weak<Registry>,
    connections: ConnectionManager,
    pending: Option<JoinHandle<Result<(), SessionError>>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        handlers: Registration,
        registry: &Arc<Registry>,
        connections: ConnectionManager,
        pending: JoinHandle<Result<(), SessionError>>,
    ) -> Self {
        Self {
            channel,
            handlers,
            registry: Arc::downgrade(registry),
            connections,
            pending: Some(pending),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the channel subscribe request issued by `subscribe`.
    ///
    /// Resolves immediately once it has been observed.
    pub async fn confirmed(&mut self) -> Result<(), SessionError> {
        match self.pending.take() {
            Some(handle) => handle
                .await
                .map_err(|err| SessionError::Aborted(err.to_string()))?,
            None => Ok(()),
        }
    }

    /// Removes both handlers right away, then unsubscribes from the channel
    /// once connected.
    ///
    /// The returned future resolves when the unsubscribe request completes.
    /// It is issued after this handle's own subscribe request has finished.
    pub fn unsubscribe(self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.handlers);
        }

        let attempt = self.connections.connect();
        let pending = self.pending;
        let channel = self.channel;

        async move {
            if let Some(handle) = pending {
                // its outcome was already reported by the subscribe task
                let _ = handle.await;
            }
            let connection = attempt.await?;
            connection
                .client()
                .unsubscribe(UnsubscribeRequest {
                    channels: vec![channel.clone()],
                })
                .await?;
            debug!(channel = %channel, "Unsubscribed");
            Ok(())
        }
    }
}
