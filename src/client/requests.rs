use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::events::Timetoken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub channels: Vec<String>,
    #[serde(default)]
    pub channel_groups: Vec<String>,
    pub with_presence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HereNowRequest {
    pub channels: Vec<String>,
    #[serde(default)]
    pub channel_groups: Vec<String>,
    pub include_uuids: bool,
    pub include_state: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occupant {
    pub uuid: String,
    pub state: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOccupancy {
    pub name: String,
    pub occupancy: usize,
    pub occupants: Vec<Occupant>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HereNowResponse {
    pub total_channels: usize,
    pub total_occupancy: usize,
    pub channels: HashMap<String, ChannelOccupancy>,
}

/// Page request for a channel's past messages.
///
/// `start` is exclusive: only messages strictly older than it are returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub channel: String,
    pub start: Option<Timetoken>,
    pub end: Option<Timetoken>,
    pub count: usize,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_true")]
    pub include_timetoken: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub entry: serde_json::Value,
    pub timetoken: Option<Timetoken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryItem>,
    pub start_timetoken: Timetoken,
    pub end_timetoken: Timetoken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRequest {
    pub channels: Vec<String>,
    /// Target user; the client's own identifier when `None`.
    pub uuid: Option<String>,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: serde_json::Value,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    pub message: serde_json::Value,
    #[serde(default = "default_true")]
    pub store_in_history: bool,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub timetoken: Timetoken,
}
