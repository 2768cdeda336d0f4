use serde::Deserialize;

use crate::client::ClientOptions;

/// Top-level configuration settings for the application.
///
/// `client` is the base option record every connection starts from; the
/// per-connection identifier is added when a connection is created.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub client: ClientOptions,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

/// Session behaviour.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    /// Page size for history requests.
    pub message_count: usize,
    /// Upper bound on the connection handshake, 10 seconds by default.
    /// `None` waits for the handshake indefinitely.
    pub handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub client: Option<PartialClientSettings>,
    pub session: Option<PartialSessionSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub subscribe_key: Option<String>,
    pub publish_key: Option<String>,
    pub origin: Option<String>,
    pub ssl: Option<bool>,
    pub presence_timeout_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub restore: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSessionSettings {
    pub message_count: Option<usize>,
    pub handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            message_count: 100,
            handshake_timeout_secs: Some(10),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
