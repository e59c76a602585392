//! Schema-parse stage: turns raw payloads into decoded values.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{BoxedProvider, DataProvider, PARSE_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::schema::{
    header_stamp, requires_schema, MessageDecoder, ENCODING_JSON, ENCODING_PROTOBUF,
};
use crate::time::TimeRange;
use crate::types::{
    ExtensionPoint, InitializationResult, MessageEvent, MessagePayload, PayloadFormat,
    Subscription,
};

/// Decodes payloads for `parsed` subscriptions; `raw` ones pass through.
///
/// A payload that fails to decode is delivered as
/// [`MessagePayload::Unparsed`] and the topic is flagged with a single
/// warning, so one bad record never drops the rest of a batch.
pub struct ParseProvider {
    child: BoxedProvider,
    decoders: HashMap<String, MessageDecoder>,
    warned: HashSet<String>,
    ext: ExtensionPoint,
    initialized: bool,
}

impl ParseProvider {
    pub fn new(child: BoxedProvider) -> Self {
        Self {
            child,
            decoders: HashMap::new(),
            warned: HashSet::new(),
            ext: ExtensionPoint::noop(),
            initialized: false,
        }
    }

    fn warn_once(&mut self, topic: &str, message: String) {
        if self.warned.insert(topic.to_string()) {
            log::warn!("{topic}: {message}");
            self.ext.warn(PARSE_PROVIDER, Some(topic), message);
        }
    }

    fn parsed_event(&mut self, raw: &MessageEvent, bytes: &[u8]) -> MessageEvent {
        let decoded = match self.decoders.get(&raw.topic) {
            Some(decoder) => decoder.decode(bytes),
            None => Err(ReplayError::Parse("no decoder for this topic".into())),
        };
        match decoded {
            Ok(value) => MessageEvent {
                topic: raw.topic.clone(),
                receive_time: raw.receive_time,
                channel_id: raw.channel_id,
                header_stamp: header_stamp(&value),
                payload: MessagePayload::Parsed(value),
            },
            Err(e) => {
                self.warn_once(&raw.topic, format!("delivering undecoded payloads: {e}"));
                MessageEvent {
                    topic: raw.topic.clone(),
                    receive_time: raw.receive_time,
                    channel_id: raw.channel_id,
                    header_stamp: None,
                    payload: MessagePayload::Unparsed(bytes.to_vec()),
                }
            }
        }
    }
}

#[async_trait]
impl DataProvider for ParseProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let result = self.child.initialize(ext.clone()).await?;
        self.ext = ext;

        for topic in &result.topics {
            let encoding = topic.message_encoding.as_str();
            match encoding {
                ENCODING_PROTOBUF | ENCODING_JSON => {
                    let definition = result.datatypes.get(&topic.datatype);
                    if definition.is_none() && requires_schema(encoding) {
                        return Err(ReplayError::MissingSchema {
                            topic: topic.name.clone(),
                            datatype: topic.datatype.clone(),
                        });
                    }
                    let decoder = MessageDecoder::new(encoding, definition)?;
                    self.decoders.insert(topic.name.clone(), decoder);
                }
                other => {
                    self.warn_once(
                        &topic.name,
                        format!("message encoding '{other}' cannot be decoded"),
                    );
                }
            }
        }

        log::info!(
            "Parser ready: {} of {} topics decodable",
            self.decoders.len(),
            result.topics.len()
        );
        self.initialized = true;
        Ok(result)
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        if !self.initialized {
            return Err(ReplayError::NotInitialized(PARSE_PROVIDER));
        }

        let raw_topics: BTreeSet<&str> = subscriptions
            .iter()
            .filter(|s| s.format == PayloadFormat::Raw)
            .map(|s| s.topic.as_str())
            .collect();
        let parsed_topics: BTreeSet<&str> = subscriptions
            .iter()
            .filter(|s| s.format == PayloadFormat::Parsed)
            .map(|s| s.topic.as_str())
            .collect();
        let child_subscriptions: Vec<Subscription> = raw_topics
            .union(&parsed_topics)
            .map(|topic| Subscription::raw(*topic))
            .collect();
        if child_subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let raw_events = self.child.get_messages(range, &child_subscriptions).await?;
        let mut events = Vec::with_capacity(raw_events.len());
        for raw in raw_events {
            let topic = raw.topic.as_str();
            let wants_raw = raw_topics.contains(topic);
            let wants_parsed = parsed_topics.contains(topic);
            if wants_parsed {
                let Some(bytes) = raw.payload.as_raw() else {
                    continue;
                };
                let parsed = self.parsed_event(&raw, bytes);
                if wants_raw {
                    events.push(raw);
                }
                events.push(parsed);
            } else if wants_raw {
                events.push(raw);
            }
        }
        Ok(events)
    }

    async fn close(&mut self) -> Result<()> {
        self.decoders.clear();
        self.child.close().await
    }
}
