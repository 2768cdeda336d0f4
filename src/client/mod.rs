//! The `client` module defines the boundary between a session and the
//! messaging service it talks to.
//!
//! A [`MessagingClient`] is one live connection to the service; a
//! [`ClientFactory`] builds one from [`ClientOptions`]. Listeners are plain
//! tokio channels that receive every [`ClientEvent`] the client produces.
//! [`memory`] ships an in-process backend implementing both traits.

pub mod events;
pub mod memory;
pub mod options;
pub mod requests;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

pub use events::{
    ClientEvent, MessageEvent, PresenceAction, PresenceEvent, StatusCategory, StatusEvent,
    Timetoken,
};
pub use options::ClientOptions;
pub use requests::{
    ChannelOccupancy, HereNowRequest, HereNowResponse, HistoryItem, HistoryRequest,
    HistoryResponse, Occupant, PublishRequest, PublishResponse, StateRequest, StateResponse,
    SubscribeRequest, UnsubscribeRequest,
};

use crate::utils::error::ClientError;

/// Identifies a listener registered with [`MessagingClient::add_listener`].
pub type ListenerId = u64;

/// One live connection to the messaging service.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Identifier this client presents to the service.
    fn uuid(&self) -> &str;

    /// Registers a listener; every subsequent event is sent to it.
    fn add_listener(&self, listener: UnboundedSender<ClientEvent>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    async fn subscribe(&self, request: SubscribeRequest) -> Result<(), ClientError>;

    async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<(), ClientError>;

    /// Shuts the client down. Later requests fail with [`ClientError::Stopped`].
    async fn stop(&self) -> Result<(), ClientError>;

    /// Lightweight round-trip returning the service's current time.
    async fn time(&self) -> Result<Timetoken, ClientError>;

    async fn here_now(&self, request: HereNowRequest) -> Result<HereNowResponse, ClientError>;

    async fn history(&self, request: HistoryRequest) -> Result<HistoryResponse, ClientError>;

    async fn set_state(&self, request: StateRequest) -> Result<StateResponse, ClientError>;

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, ClientError>;
}

/// Builds clients for a session. Called once per connection attempt.
pub trait ClientFactory: Send + Sync {
    fn create(&self, options: ClientOptions) -> Result<Arc<dyn MessagingClient>, ClientError>;
}
