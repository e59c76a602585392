//! Immutable snapshots the Player publishes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::MessageDefinition;
use crate::time::Time;
use crate::types::{MessageEvent, Topic};

/// Speed factors offered to operators.
pub const PLAYBACK_SPEEDS: [f64; 11] = [0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 0.8, 1.0, 2.0, 3.0, 5.0];

/// Key messages are delivered in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrder {
    #[default]
    ReceiveTime,
    /// Timestamp inside the payload, falling back to receive time.
    HeaderStamp,
}

impl MessageOrder {
    pub fn key(self, event: &MessageEvent) -> Time {
        match self {
            MessageOrder::ReceiveTime => event.receive_time,
            MessageOrder::HeaderStamp => event.header_stamp.unwrap_or(event.receive_time),
        }
    }

    /// Stable sort so equal keys keep provider order.
    pub fn sort(self, events: &mut [MessageEvent]) {
        if self == MessageOrder::HeaderStamp {
            events.sort_by_key(|e| self.key(e));
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    #[default]
    Uninitialized,
    Initializing,
    Idle,
    Playing,
    Seeking,
    Closed,
}

/// A recoverable problem reported by the provider tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerWarning {
    pub source: String,
    pub topic: Option<String>,
    pub message: String,
}

/// What listeners see after every change.
///
/// `messages` holds only the batch delivered with this snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub status: PlayerStatus,
    pub is_playing: bool,
    pub speed: f64,
    pub current_time: Time,
    pub start_time: Time,
    pub end_time: Time,
    pub topics: Vec<Topic>,
    pub datatypes: BTreeMap<String, MessageDefinition>,
    pub messages: Vec<MessageEvent>,
    pub warnings: Vec<PlayerWarning>,
    /// Seek generation; bumps on every seek.
    pub last_seek_time: u64,
    pub message_order: MessageOrder,
    /// Fraction of the log held in memory.
    pub progress: f64,
    pub fatal_error: Option<String>,
    pub total_bytes_received: u64,
}
