//! The `utils` module provides the shared plumbing used across `chatwire`:
//! the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{ClientError, SessionError};
