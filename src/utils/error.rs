//! Error types for the client boundary and the session layer.
//!
//! Both enums are `Clone`: a single connection attempt is shared between
//! every caller waiting on it, and each of them receives the same error.

use std::time::Duration;

use thiserror::Error;

use crate::client::StatusCategory;

/// Errors reported by a [`MessagingClient`](crate::client::MessagingClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The backend answered with an error status.
    #[error("backend reported status {0}")]
    Status(StatusCategory),

    /// The client was stopped and no longer accepts requests.
    #[error("client has been stopped")]
    Stopped,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid client options: {0}")]
    InvalidOptions(String),
}

/// Errors surfaced by [`Session`](crate::session::Session) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A disconnect or network-down status arrived while connecting.
    #[error("received a network-down status ({0}) while connecting")]
    NetworkDown(StatusCategory),

    /// The liveness round-trip failed.
    #[error("messaging service failed to respond to time request: {0}")]
    Handshake(String),

    #[error("messaging service did not answer the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    /// Backend-reported operation failure, carrying the status category.
    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// The task establishing the connection panicked or was cancelled.
    #[error("connection task ended abnormally: {0}")]
    Aborted(String),
}

impl SessionError {
    /// Translates a client error for operations that report backend failures
    /// by their status category (participants, history, publish).
    pub fn from_operation(err: ClientError) -> Self {
        match err {
            ClientError::Status(category) => SessionError::Backend(category.to_string()),
            other => SessionError::Client(other),
        }
    }

    /// The backend status category, when this is a backend-reported error.
    pub fn category(&self) -> Option<&str> {
        match self {
            SessionError::Backend(category) => Some(category),
            _ => None,
        }
    }
}
