use serde::{Deserialize, Serialize};

/// Options handed to a [`ClientFactory`](super::ClientFactory) when a
/// connection is created.
///
/// The base record comes from configuration; `uuid` is filled in per
/// connection and is never read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub subscribe_key: String,
    pub publish_key: Option<String>,
    pub origin: String,
    pub ssl: bool,
    pub presence_timeout_secs: u64,
    pub heartbeat_interval_secs: Option<u64>,
    pub restore: bool,
    #[serde(skip)]
    pub uuid: Option<String>,
}

impl ClientOptions {
    /// Returns a copy of these options carrying the given client identifier.
    pub fn with_uuid(&self, uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            ..self.clone()
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            subscribe_key: "demo".to_string(),
            publish_key: Some("demo".to_string()),
            origin: "ps.pndsn.com".to_string(),
            ssl: true,
            presence_timeout_secs: 300,
            heartbeat_interval_secs: None,
            restore: false,
            uuid: None,
        }
    }
}
