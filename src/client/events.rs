use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend time cursor, in 100ns units since the Unix epoch.
pub type Timetoken = u64;

/// Category carried by a status event or an operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Connected,
    Reconnected,
    NetworkUp,
    NetworkDown,
    NetworkIssues,
    Disconnected,
    UnexpectedDisconnect,
    Timeout,
    AccessDenied,
    BadRequest,
    Unknown,
}

impl StatusCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCategory::Connected => "connected",
            StatusCategory::Reconnected => "reconnected",
            StatusCategory::NetworkUp => "network_up",
            StatusCategory::NetworkDown => "network_down",
            StatusCategory::NetworkIssues => "network_issues",
            StatusCategory::Disconnected => "disconnected",
            StatusCategory::UnexpectedDisconnect => "unexpected_disconnect",
            StatusCategory::Timeout => "timeout",
            StatusCategory::AccessDenied => "access_denied",
            StatusCategory::BadRequest => "bad_request",
            StatusCategory::Unknown => "unknown",
        }
    }

    /// `Connected` or `NetworkUp`.
    pub fn is_up(&self) -> bool {
        matches!(self, StatusCategory::Connected | StatusCategory::NetworkUp)
    }

    /// `Disconnected` or `NetworkDown`.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            StatusCategory::Disconnected | StatusCategory::NetworkDown
        )
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub category: StatusCategory,
    pub error: bool,
    pub operation: Option<String>,
    #[serde(default)]
    pub affected_channels: Vec<String>,
}

impl StatusEvent {
    pub fn new(category: StatusCategory) -> Self {
        Self {
            category,
            error: false,
            operation: None,
            affected_channels: Vec::new(),
        }
    }
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub channel: String,
    /// Identifier of the publishing client, when known.
    pub publisher: Option<String>,
    pub message: serde_json::Value,
    pub timetoken: Timetoken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

/// A presence change on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub channel: String,
    pub action: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: usize,
    pub state: Option<serde_json::Value>,
    pub timetoken: Timetoken,
}

/// Everything a listener can receive from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Status(StatusEvent),
    Message(MessageEvent),
    Presence(PresenceEvent),
}
