//! # chatwire
//!
//! `chatwire` is a session layer over a real-time pub/sub messaging service.
//! A [`Session`](session::Session) keeps one lazily created connection,
//! fans inbound message and presence events out to every registered handler,
//! and exposes async operations for publishing, history, presence queries
//! and typing state.
//!
//! ## Core Modules
//!
//! - `client`: the boundary to the messaging service (`MessagingClient`,
//!   `ClientFactory`), its event and request types, and an in-memory backend.
//! - `config`: loads client options and session settings.
//! - `session`: connection lifecycle, handler registry and subscriptions.
//! - `utils`: error types and logging setup.

pub mod client;
pub mod config;
pub mod session;
pub mod utils;

pub use client::{ClientFactory, ClientOptions, MessagingClient};
pub use session::{LifecycleEvent, Session, Subscription};
pub use utils::error::{ClientError, SessionError};
