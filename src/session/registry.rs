//! Handler sets shared by every subscription of a session.
//!
//! Inbound message and presence events are fanned out to every registered
//! handler regardless of the channel the handler was subscribed for.
//! Membership is keyed by the identity of the `Arc` holding the handler, so
//! registering the same `Arc` twice keeps a single entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::client::{ClientEvent, MessageEvent, PresenceEvent};

/// Receives every message event delivered to the session.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, event: &MessageEvent);
}

/// Receives every presence event delivered to the session.
pub trait PresenceHandler: Send + Sync {
    fn on_presence(&self, event: &PresenceEvent);
}

impl<F> MessageHandler for F
where
    F: Fn(&MessageEvent) + Send + Sync,
{
    fn on_message(&self, event: &MessageEvent) {
        self(event)
    }
}

impl<F> PresenceHandler for F
where
    F: Fn(&PresenceEvent) + Send + Sync,
{
    fn on_presence(&self, event: &PresenceEvent) {
        self(event)
    }
}

/// Identity of a registered handler: the address of its allocation.
pub type HandlerKey = usize;

pub fn handler_key<H: ?Sized>(handler: &Arc<H>) -> HandlerKey {
    Arc::as_ptr(handler) as *const () as usize
}

/// Weak handles to a registered handler pair.
///
/// A `Weak` keeps its allocation reserved, so the address it points at
/// cannot be handed to a different handler while the handle exists.
pub struct Registration {
    presence: Weak<dyn PresenceHandler>,
    message: Weak<dyn MessageHandler>,
}

/// A set of handlers with identity-based membership.
pub struct HandlerSet<H: ?Sized> {
    handlers: Mutex<HashMap<HandlerKey, Arc<H>>>,
}

impl<H: ?Sized> Default for HandlerSet<H> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: ?Sized> HandlerSet<H> {
    fn lock(&self) -> MutexGuard<'_, HashMap<HandlerKey, Arc<H>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds the handler unless the same `Arc` is already present.
    pub fn insert(&self, handler: Arc<H>) -> HandlerKey {
        let key = handler_key(&handler);
        self.lock().entry(key).or_insert(handler);
        key
    }

    pub fn remove(&self, key: HandlerKey) -> bool {
        self.lock().remove(&key).is_some()
    }

    /// Removes the entry `handler` points at, if it is still present.
    pub fn remove_weak(&self, handler: &Weak<H>) -> bool {
        let key = Weak::as_ptr(handler) as *const () as usize;
        let mut handlers = self.lock();
        let same = handlers.get(&key).is_some_and(|entry| {
            std::ptr::addr_eq(Arc::as_ptr(entry), Weak::as_ptr(handler))
        });
        same && handlers.remove(&key).is_some()
    }

    pub fn contains(&self, key: HandlerKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Handlers present right now. Callers invoke them after the lock is
    /// released, so a handler may subscribe or unsubscribe reentrantly.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.lock().values().cloned().collect()
    }
}

/// The presence and message handler sets of one session.
#[derive(Default)]
pub struct Registry {
    presence: HandlerSet<dyn PresenceHandler>,
    messages: HandlerSet<dyn MessageHandler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a presence/message handler pair.
    pub fn add(
        &self,
        presence: Arc<dyn PresenceHandler>,
        message: Arc<dyn MessageHandler>,
    ) -> Registration {
        let registration = Registration {
            presence: Arc::downgrade(&presence),
            message: Arc::downgrade(&message),
        };
        self.presence.insert(presence);
        self.messages.insert(message);
        registration
    }

    pub fn remove(&self, registration: &Registration) {
        self.presence.remove_weak(&registration.presence);
        self.messages.remove_weak(&registration.message);
    }

    pub fn presence_handlers(&self) -> &HandlerSet<dyn PresenceHandler> {
        &self.presence
    }

    pub fn message_handlers(&self) -> &HandlerSet<dyn MessageHandler> {
        &self.messages
    }

    /// Delivers a message or presence event to every handler of its kind.
    /// Status events are not fanned out.
    pub fn dispatch(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Message(message) => {
                for handler in self.messages.snapshot() {
                    handler.on_message(message);
                }
            }
            ClientEvent::Presence(presence) => {
                for handler in self.presence.snapshot() {
                    handler.on_presence(presence);
                }
            }
            ClientEvent::Status(_) => {}
        }
    }
}
