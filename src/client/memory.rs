//! In-process messaging backend.
//!
//! `MemoryBackend` plays the role of the remote service: it keeps channel
//! subscribers, presence state and a bounded per-channel history, and fans
//! published messages out to every subscribed client. Each client created
//! through its [`ClientFactory`] implementation is a [`MemoryClient`] bound to
//! the shared state.
//!
//! Every request is recorded, and a few hooks let callers simulate the
//! network: broadcasting a status, or failing the next call of an operation
//! with a given category.
//!
//! A client's slot lives until the client is stopped or dropped, whichever
//! comes first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use super::{
    ChannelOccupancy, ClientEvent, ClientFactory, ClientOptions, HereNowRequest, HereNowResponse,
    HistoryItem, HistoryRequest, HistoryResponse, ListenerId, MessageEvent, MessagingClient,
    Occupant, PresenceAction, PresenceEvent, PublishRequest, PublishResponse, StateRequest,
    StateResponse, StatusCategory, StatusEvent, SubscribeRequest, Timetoken, UnsubscribeRequest,
};
use crate::utils::error::ClientError;

/// Operations that can be made to fail through [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Time,
    HereNow,
    History,
    SetState,
    Publish,
}

/// A request as received by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Stop,
    Time,
    HereNow(HereNowRequest),
    History(HistoryRequest),
    SetState(StateRequest),
    Publish(PublishRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Identifier of the client that sent it.
    pub uuid: String,
    pub request: Request,
}

#[derive(Debug, Default)]
struct Channel {
    subscribers: HashSet<String>,
    presence_watchers: HashSet<String>,
    states: HashMap<String, serde_json::Value>,
    history: VecDeque<HistoryItem>,
}

#[derive(Debug, Default)]
struct ClientSlot {
    listeners: HashMap<ListenerId, UnboundedSender<ClientEvent>>,
    connected: bool,
}

#[derive(Debug)]
struct BackendState {
    channels: HashMap<String, Channel>,
    clients: HashMap<String, ClientSlot>,
    requests: Vec<RecordedRequest>,
    failures: HashMap<Operation, StatusCategory>,
    history_limit: usize,
    latency: Duration,
    last_timetoken: Timetoken,
    next_listener_id: ListenerId,
}

impl BackendState {
    fn next_timetoken(&mut self) -> Timetoken {
        let now = current_timetoken();
        self.last_timetoken = now.max(self.last_timetoken + 1);
        self.last_timetoken
    }

    fn send_to(&mut self, uuid: &str, event: &ClientEvent) {
        if let Some(slot) = self.clients.get_mut(uuid) {
            // closed receivers are dropped listeners
            slot.listeners
                .retain(|_, listener| listener.send(event.clone()).is_ok());
        }
    }

    fn announce(
        &mut self,
        channel: &str,
        action: PresenceAction,
        uuid: &str,
        state: Option<serde_json::Value>,
    ) {
        let timetoken = self.next_timetoken();
        let Some(ch) = self.channels.get(channel) else {
            return;
        };
        let event = ClientEvent::Presence(PresenceEvent {
            channel: channel.to_string(),
            action,
            uuid: Some(uuid.to_string()),
            occupancy: ch.subscribers.len(),
            state,
            timetoken,
        });
        let watchers: Vec<String> = ch.presence_watchers.iter().cloned().collect();
        for watcher in watchers {
            self.send_to(&watcher, &event);
        }
    }

    /// Leaves every channel `uuid` is in and drops its slot.
    fn release(&mut self, uuid: &str) {
        let channels: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, ch)| {
                ch.subscribers.contains(uuid) || ch.presence_watchers.contains(uuid)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for channel in channels {
            self.leave(&channel, uuid);
        }
        self.clients.remove(uuid);
    }

    fn leave(&mut self, channel: &str, uuid: &str) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let was_subscribed = ch.subscribers.remove(uuid);
        ch.presence_watchers.remove(uuid);
        ch.states.remove(uuid);
        if was_subscribed {
            self.announce(channel, PresenceAction::Leave, uuid, None);
        }
    }
}

fn current_timetoken() -> Timetoken {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default() * 10
}

/// Shared in-process service. Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    created: Arc<AtomicUsize>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Messages kept per channel unless overridden with [`with_history_limit`](Self::with_history_limit).
    pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                channels: HashMap::new(),
                clients: HashMap::new(),
                requests: Vec::new(),
                failures: HashMap::new(),
                history_limit: Self::DEFAULT_HISTORY_LIMIT,
                latency: Duration::ZERO,
                last_timetoken: 0,
                next_listener_id: 1,
            })),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_history_limit(self, limit: usize) -> Self {
        self.lock().history_limit = limit;
        self
    }

    /// Delay applied to every request before it is served.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of clients created through the factory.
    pub fn clients_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Clients created and not yet stopped or dropped.
    pub fn live_clients(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn listener_count(&self, uuid: &str) -> usize {
        self.lock()
            .clients
            .get(uuid)
            .map_or(0, |slot| slot.listeners.len())
    }

    /// Identifiers currently subscribed to `channel`, sorted.
    pub fn subscribers(&self, channel: &str) -> Vec<String> {
        let state = self.lock();
        let mut subscribers: Vec<String> = state
            .channels
            .get(channel)
            .map(|ch| ch.subscribers.iter().cloned().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    /// Makes the next call of `operation` fail with `category`.
    pub fn fail_next(&self, operation: Operation, category: StatusCategory) {
        self.lock().failures.insert(operation, category);
    }

    /// Sends a status event to every live client.
    pub fn emit_status(&self, category: StatusCategory) {
        let mut state = self.lock();
        let event = ClientEvent::Status(StatusEvent {
            error: category.is_down(),
            ..StatusEvent::new(category)
        });
        let uuids: Vec<String> = state.clients.keys().cloned().collect();
        for uuid in uuids {
            state.send_to(&uuid, &event);
        }
    }

    /// Publishes on behalf of an identifier that has no client of its own.
    pub fn publish_as(
        &self,
        publisher: &str,
        channel: &str,
        message: serde_json::Value,
    ) -> Timetoken {
        let mut state = self.lock();
        Self::deliver(&mut state, publisher, channel, message, true)
    }

    fn deliver(
        state: &mut BackendState,
        publisher: &str,
        channel: &str,
        message: serde_json::Value,
        store_in_history: bool,
    ) -> Timetoken {
        let timetoken = state.next_timetoken();
        let limit = state.history_limit;
        let ch = state.channels.entry(channel.to_string()).or_default();

        if store_in_history {
            if ch.history.len() >= limit {
                ch.history.pop_front();
            }
            ch.history.push_back(HistoryItem {
                entry: message.clone(),
                timetoken: Some(timetoken),
            });
        }

        let event = ClientEvent::Message(MessageEvent {
            channel: channel.to_string(),
            publisher: Some(publisher.to_string()),
            message,
            timetoken,
        });
        let subscribers: Vec<String> = ch.subscribers.iter().cloned().collect();
        for sub_id in subscribers {
            state.send_to(&sub_id, &event);
        }
        debug!(channel, publisher, timetoken, "Delivered message");
        timetoken
    }

    /// Records the request and applies latency and injected failures.
    async fn admit(
        &self,
        uuid: &str,
        operation: Option<Operation>,
        request: Request,
    ) -> Result<(), ClientError> {
        let latency = {
            let mut state = self.lock();
            if !state.clients.contains_key(uuid) {
                return Err(ClientError::Stopped);
            }
            state.requests.push(RecordedRequest {
                uuid: uuid.to_string(),
                request,
            });
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = operation.and_then(|op| self.lock().failures.remove(&op));
        match injected {
            Some(category) => Err(ClientError::Status(category)),
            None => Ok(()),
        }
    }
}

impl ClientFactory for MemoryBackend {
    fn create(&self, options: ClientOptions) -> Result<Arc<dyn MessagingClient>, ClientError> {
        if options.subscribe_key.is_empty() {
            return Err(ClientError::InvalidOptions(
                "subscribe_key must not be empty".to_string(),
            ));
        }
        let uuid = options
            .uuid
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.lock()
            .clients
            .insert(uuid.clone(), ClientSlot::default());
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryClient {
            uuid,
            backend: self.clone(),
        }))
    }
}

/// A client connected to a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryClient {
    uuid: String,
    backend: MemoryBackend,
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.backend.lock().release(&self.uuid);
    }
}

#[async_trait]
impl MessagingClient for MemoryClient {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn add_listener(&self, listener: UnboundedSender<ClientEvent>) -> ListenerId {
        let mut state = self.backend.lock();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        // a stopped client never delivers, so the listener is dropped
        if let Some(slot) = state.clients.get_mut(&self.uuid) {
            slot.listeners.insert(id, listener);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        if let Some(slot) = self.backend.lock().clients.get_mut(&self.uuid) {
            slot.listeners.remove(&id);
        }
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<(), ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::Subscribe),
                Request::Subscribe(request.clone()),
            )
            .await?;

        let mut state = self.backend.lock();
        for channel in &request.channels {
            let ch = state.channels.entry(channel.clone()).or_default();
            let joined = ch.subscribers.insert(self.uuid.clone());
            if request.with_presence {
                ch.presence_watchers.insert(self.uuid.clone());
            }
            if joined {
                state.announce(channel, PresenceAction::Join, &self.uuid, None);
            }
        }

        let first = state
            .clients
            .get_mut(&self.uuid)
            .is_some_and(|slot| !std::mem::replace(&mut slot.connected, true));
        if first {
            let event = ClientEvent::Status(StatusEvent {
                operation: Some("subscribe".to_string()),
                affected_channels: request.channels.clone(),
                ..StatusEvent::new(StatusCategory::Connected)
            });
            state.send_to(&self.uuid, &event);
        }
        Ok(())
    }

    async fn unsubscribe(&self, request: UnsubscribeRequest) -> Result<(), ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::Unsubscribe),
                Request::Unsubscribe(request.clone()),
            )
            .await?;

        let mut state = self.backend.lock();
        for channel in &request.channels {
            state.leave(channel, &self.uuid);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.backend.admit(&self.uuid, None, Request::Stop).await?;
        self.backend.lock().release(&self.uuid);
        Ok(())
    }

    async fn time(&self) -> Result<Timetoken, ClientError> {
        self.backend
            .admit(&self.uuid, Some(Operation::Time), Request::Time)
            .await?;
        Ok(current_timetoken())
    }

    async fn here_now(&self, request: HereNowRequest) -> Result<HereNowResponse, ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::HereNow),
                Request::HereNow(request.clone()),
            )
            .await?;

        let state = self.backend.lock();
        let mut response = HereNowResponse::default();
        for name in &request.channels {
            let Some(ch) = state.channels.get(name) else {
                continue;
            };
            let mut uuids: Vec<&String> = ch.subscribers.iter().collect();
            uuids.sort();
            let occupants = if request.include_uuids {
                uuids
                    .into_iter()
                    .map(|uuid| Occupant {
                        uuid: uuid.clone(),
                        state: request
                            .include_state
                            .then(|| ch.states.get(uuid).cloned())
                            .flatten(),
                    })
                    .collect()
            } else {
                Vec::new()
            };
            response.total_channels += 1;
            response.total_occupancy += ch.subscribers.len();
            response.channels.insert(
                name.clone(),
                ChannelOccupancy {
                    name: name.clone(),
                    occupancy: ch.subscribers.len(),
                    occupants,
                },
            );
        }
        Ok(response)
    }

    async fn history(&self, request: HistoryRequest) -> Result<HistoryResponse, ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::History),
                Request::History(request.clone()),
            )
            .await?;

        let state = self.backend.lock();
        let in_range: Vec<&HistoryItem> = state
            .channels
            .get(&request.channel)
            .map(|ch| {
                ch.history
                    .iter()
                    .filter(|item| {
                        let tt = item.timetoken.unwrap_or_default();
                        request.start.is_none_or(|start| tt < start)
                            && request.end.is_none_or(|end| tt >= end)
                    })
                    .collect()
            })
            .unwrap_or_default();

        // newest page by default, oldest page when reversed; both chronological
        let page = if request.reverse {
            &in_range[..request.count.min(in_range.len())]
        } else {
            &in_range[in_range.len().saturating_sub(request.count)..]
        };

        let start_timetoken = page
            .first()
            .and_then(|item| item.timetoken)
            .unwrap_or_default();
        let end_timetoken = page
            .last()
            .and_then(|item| item.timetoken)
            .unwrap_or_default();
        let messages = page
            .iter()
            .map(|item| HistoryItem {
                entry: item.entry.clone(),
                timetoken: item.timetoken.filter(|_| request.include_timetoken),
            })
            .collect();

        Ok(HistoryResponse {
            messages,
            start_timetoken,
            end_timetoken,
        })
    }

    async fn set_state(&self, request: StateRequest) -> Result<StateResponse, ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::SetState),
                Request::SetState(request.clone()),
            )
            .await?;

        let target = request.uuid.clone().unwrap_or_else(|| self.uuid.clone());
        let mut state = self.backend.lock();
        for channel in &request.channels {
            state
                .channels
                .entry(channel.clone())
                .or_default()
                .states
                .insert(target.clone(), request.state.clone());
            state.announce(
                channel,
                PresenceAction::StateChange,
                &target,
                Some(request.state.clone()),
            );
        }
        Ok(StateResponse {
            state: request.state,
            channels: request.channels,
        })
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, ClientError> {
        self.backend
            .admit(
                &self.uuid,
                Some(Operation::Publish),
                Request::Publish(request.clone()),
            )
            .await?;

        let mut state = self.backend.lock();
        let timetoken = MemoryBackend::deliver(
            &mut state,
            &self.uuid,
            &request.channel,
            request.message,
            request.store_in_history,
        );
        Ok(PublishResponse { timetoken })
    }
}
