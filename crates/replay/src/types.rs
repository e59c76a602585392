//! Data model shared by every provider stage and the Player.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::schema::MessageDefinition;
use crate::time::{Time, TimeRange};

/// Metadata key used by stages to surface recoverable problems.
pub const METADATA_WARNING: &str = "warning";

/// Metadata key used by the repair stage when it first rewrites a topic.
pub const METADATA_REPAIRED: &str = "repaired";

/// One raw entry of a recorded log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub channel_id: u16,
    pub receive_time: Time,
    pub data: Vec<u8>,
}

/// A named stream of same-typed messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub name: String,
    pub datatype: String,
    pub channel_id: u16,
    /// Payload encoding as recorded (`protobuf`, `json`, ...).
    pub message_encoding: String,
}

/// Requested payload representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Raw,
    Parsed,
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Raw => write!(f, "raw"),
            PayloadFormat::Parsed => write!(f, "parsed"),
        }
    }
}

/// A topic plus the format the consumer wants it in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub format: PayloadFormat,
}

impl Subscription {
    pub fn raw(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            format: PayloadFormat::Raw,
        }
    }

    pub fn parsed(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            format: PayloadFormat::Parsed,
        }
    }
}

/// Message body: untouched bytes or a decoded value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MessagePayload {
    Raw(Vec<u8>),
    Parsed(Value),
    /// Raw bytes answering a `parsed` subscription whose decode failed.
    Unparsed(Vec<u8>),
}

impl MessagePayload {
    /// The subscription format this payload answers.
    pub fn format(&self) -> PayloadFormat {
        match self {
            MessagePayload::Raw(_) => PayloadFormat::Raw,
            MessagePayload::Parsed(_) | MessagePayload::Unparsed(_) => PayloadFormat::Parsed,
        }
    }

    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            MessagePayload::Raw(bytes) | MessagePayload::Unparsed(bytes) => Some(bytes),
            MessagePayload::Parsed(_) => None,
        }
    }

    pub fn as_parsed(&self) -> Option<&Value> {
        match self {
            MessagePayload::Parsed(value) => Some(value),
            _ => None,
        }
    }
}

/// A message delivered on a topic at a receive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub topic: String,
    pub receive_time: Time,
    pub channel_id: u16,
    pub payload: MessagePayload,
    /// Timestamp embedded in the message itself, when one could be extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_stamp: Option<Time>,
}

impl MessageEvent {
    pub fn raw(
        topic: impl Into<String>,
        receive_time: Time,
        channel_id: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            receive_time,
            channel_id,
            payload: MessagePayload::Raw(data),
            header_stamp: None,
        }
    }

    /// Size of the event once serialized; used for cache accounting.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self)
            .map(|v| v.len())
            .unwrap_or_else(|_| self.topic.len() + self.payload.as_raw().map_or(0, <[u8]>::len))
    }

    /// Whether this event answers one of the given subscriptions.
    pub fn matches(&self, subscriptions: &[Subscription]) -> bool {
        let format = self.payload.format();
        subscriptions
            .iter()
            .any(|s| s.topic == self.topic && s.format == format)
    }
}

/// What a provider exposes once initialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationResult {
    pub topics: Vec<Topic>,
    pub datatypes: BTreeMap<String, MessageDefinition>,
    pub time_range: TimeRange,
}

impl InitializationResult {
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.name == name)
    }
}

type ProgressFn = dyn Fn(f64) + Send + Sync;
type MetadataFn = dyn Fn(&str, Value) + Send + Sync;

/// Side-channel callbacks handed to `initialize`.
///
/// Stages keep a clone and may call it from `get_messages` as well.
#[derive(Clone)]
pub struct ExtensionPoint {
    progress: Arc<ProgressFn>,
    report_metadata: Arc<MetadataFn>,
}

impl ExtensionPoint {
    pub fn new(
        progress: impl Fn(f64) + Send + Sync + 'static,
        report_metadata: impl Fn(&str, Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            progress: Arc::new(progress),
            report_metadata: Arc::new(report_metadata),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {}, |_, _| {})
    }

    /// Report the loaded fraction of the source time range.
    pub fn progress(&self, fraction: f64) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }

    pub fn report_metadata(&self, key: &str, value: Value) {
        (self.report_metadata)(key, value);
    }

    /// Report a recoverable problem attributed to a stage and optional topic.
    pub fn warn(&self, source: &str, topic: Option<&str>, message: impl Into<String>) {
        self.report_metadata(
            METADATA_WARNING,
            serde_json::json!({
                "source": source,
                "topic": topic,
                "message": message.into(),
            }),
        );
    }
}

impl Default for ExtensionPoint {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPoint").finish_non_exhaustive()
    }
}

/// Serializable recipe for rebuilding a provider tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub children: Vec<ProviderDescriptor>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ProviderDescriptor) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = ProviderDescriptor>) -> Self {
        self.children.extend(children);
        self
    }
}
