//! Session
//!
//! A `Session` is the context object applications construct once and share:
//! it owns one `ConnectionManager` (the single lazily created connection) and
//! one `Registry` (the presence and message handler sets). Every operation
//! obtains the shared connection first, creating it on first use.
//!
//! All operations must run inside a tokio runtime. `subscribe` and
//! `Subscription::unsubscribe` update the handler sets synchronously and
//! defer the network request.

pub mod connection;
pub mod registry;
pub mod subscription;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::client::{
    ClientFactory, ClientOptions, HereNowRequest, HistoryRequest, HistoryResponse, Occupant,
    PublishRequest, StateRequest, StateResponse, SubscribeRequest, Timetoken,
};
use crate::config::{SessionSettings, Settings};
use crate::utils::error::SessionError;

pub use connection::{ConnectAttempt, Connection, ConnectionManager, LifecycleEvent};
pub use registry::{
    HandlerKey, HandlerSet, MessageHandler, PresenceHandler, Registration, Registry,
};
pub use subscription::Subscription;

pub struct Session {
    connections: ConnectionManager,
    registry: Arc<Registry>,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        options: ClientOptions,
        settings: SessionSettings,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let connections = ConnectionManager::new(
            factory,
            options,
            settings.handshake_timeout_secs.map(Duration::from_secs),
            registry.clone(),
        );
        Self {
            connections,
            registry,
            settings,
        }
    }

    pub fn from_settings(factory: Arc<dyn ClientFactory>, settings: &Settings) -> Self {
        Self::new(factory, settings.client.clone(), settings.session.clone())
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// See [`ConnectionManager::connect`].
    pub fn connect(&self) -> ConnectAttempt {
        self.connections.connect()
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.connections.disconnect().await
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.connections.lifecycle()
    }

    /// Registers both handlers and subscribes to `channel` with presence
    /// enabled once the connection is up.
    ///
    /// Returns without waiting for the network request.
    pub fn subscribe(
        &self,
        channel: &str,
        presence: Arc<dyn PresenceHandler>,
        message: Arc<dyn MessageHandler>,
    ) -> Subscription {
        let handlers = self.registry.add(presence, message);
        let attempt = self.connections.connect();
        let request = SubscribeRequest {
            channels: vec![channel.to_string()],
            channel_groups: Vec::new(),
            with_presence: true,
        };

        let name = channel.to_string();
        let pending = tokio::spawn(async move {
            let result = match attempt.await {
                Ok(connection) => connection
                    .client()
                    .subscribe(request)
                    .await
                    .map_err(SessionError::from),
                Err(err) => Err(err),
            };
            match &result {
                Ok(()) => debug!(channel = %name, "Subscribed"),
                Err(err) => warn!(channel = %name, error = %err, "Channel subscribe failed"),
            }
            result
        });

        Subscription::new(
            channel.to_string(),
            handlers,
            &self.registry,
            self.connections.clone(),
            pending,
        )
    }

    /// Who is currently on `channel`, with their state.
    pub async fn participants(&self, channel: &str) -> Result<Vec<Occupant>, SessionError> {
        let connection = self.connect().await?;
        let mut response = connection
            .client()
            .here_now(HereNowRequest {
                channels: vec![channel.to_string()],
                channel_groups: Vec::new(),
                include_uuids: true,
                include_state: true,
            })
            .await
            .map_err(SessionError::from_operation)?;

        Ok(response
            .channels
            .remove(channel)
            .map(|occupancy| occupancy.occupants)
            .unwrap_or_default())
    }

    /// Up to `message_count` messages older than `start`, as returned by the
    /// backend.
    pub async fn history(
        &self,
        channel: &str,
        start: Option<Timetoken>,
    ) -> Result<HistoryResponse, SessionError> {
        let connection = self.connect().await?;
        connection
            .client()
            .history(HistoryRequest {
                channel: channel.to_string(),
                start,
                end: None,
                count: self.settings.message_count,
                reverse: false,
                include_timetoken: true,
            })
            .await
            .map_err(SessionError::from_operation)
    }

    /// Sets `{"isTyping": is_typing}` as `uuid`'s state on `channel`.
    pub async fn publish_typing_state(
        &self,
        channel: &str,
        uuid: &str,
        is_typing: bool,
    ) -> Result<StateResponse, SessionError> {
        let connection = self.connect().await?;
        let response = connection
            .client()
            .set_state(StateRequest {
                channels: vec![channel.to_string()],
                uuid: Some(uuid.to_string()),
                state: json!({ "isTyping": is_typing }),
            })
            .await?;
        Ok(response)
    }

    pub async fn publish_message(
        &self,
        channel: &str,
        message: serde_json::Value,
    ) -> Result<(), SessionError> {
        let connection = self.connect().await?;
        connection
            .client()
            .publish(PublishRequest {
                channel: channel.to_string(),
                message,
                store_in_history: true,
                meta: None,
            })
            .await
            .map_err(SessionError::from_operation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
