//! Frames exchanged across the worker boundary.
//!
//! Every frame is one JSON text message:
//!
//! - request: `{ "id", "method", "params" }`
//! - success: `{ "id", "result" }`
//! - error: `{ "id", "error" }`
//! - callback: `{ "id", "callback": "progress" | "reportMetadata", "data" }`,
//!   tagged with the id of the call in progress when it was raised.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::TimeRange;
use crate::types::{MessageEvent, ProviderDescriptor, Subscription};

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_GET_MESSAGES: &str = "getMessages";
pub const METHOD_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallbackKind {
    Progress,
    ReportMetadata,
}

/// Anything the executor sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Callback {
        id: u64,
        callback: CallbackKind,
        data: Value,
    },
    Error {
        id: u64,
        error: String,
    },
    Success {
        id: u64,
        #[serde(default)]
        result: Value,
    },
}

impl Reply {
    pub fn id(&self) -> u64 {
        match self {
            Reply::Callback { id, .. } | Reply::Error { id, .. } | Reply::Success { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub child_descriptor: ProviderDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMessagesParams {
    pub range: TimeRange,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMessagesResult {
    pub events: Vec<MessageEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataData {
    pub key: String,
    pub value: Value,
}
