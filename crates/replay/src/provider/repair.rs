//! Payload repair stage.
//!
//! Normalises known malformed encodings before they reach the parser:
//!
//! - `json`: a leading UTF-8 byte order mark and trailing NUL or whitespace
//!   padding are stripped.
//! - `protobuf`: a gRPC length-prefix frame (flag byte `0x00`, big-endian
//!   `u32` length equal to the rest of the payload) is unwrapped. Field
//!   number zero is invalid in protobuf, so a bare message never starts with
//!   `0x00`.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};

use super::{BoxedProvider, DataProvider, REPAIR_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::schema::{ENCODING_JSON, ENCODING_PROTOBUF};
use crate::time::TimeRange;
use crate::types::{
    ExtensionPoint, InitializationResult, MessageEvent, MessagePayload, Subscription,
    METADATA_REPAIRED,
};

const UTF8_BOM: &[u8] = &[0xef, 0xbb, 0xbf];
const GRPC_FRAME_HEADER: usize = 5;

/// Strip a byte order mark and trailing padding from a JSON payload.
///
/// Returns `None` when the payload is already clean.
pub fn repair_json(payload: &[u8]) -> Option<Vec<u8>> {
    let body = payload.strip_prefix(UTF8_BOM).unwrap_or(payload);
    let end = body
        .iter()
        .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let body = &body[..end];
    (body.len() != payload.len()).then(|| body.to_vec())
}

/// Unwrap a gRPC length-prefixed frame around a protobuf payload.
pub fn unwrap_grpc_frame(payload: &[u8]) -> Option<&[u8]> {
    if payload.len() < GRPC_FRAME_HEADER || payload[0] != 0 {
        return None;
    }
    let len = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;
    (len == payload.len() - GRPC_FRAME_HEADER).then(|| &payload[GRPC_FRAME_HEADER..])
}

fn repair(encoding: &str, payload: &[u8]) -> Option<Vec<u8>> {
    match encoding {
        ENCODING_JSON => repair_json(payload),
        ENCODING_PROTOBUF => unwrap_grpc_frame(payload).map(<[u8]>::to_vec),
        _ => None,
    }
}

/// Rewrites raw payloads of its child in place.
pub struct RepairProvider {
    child: BoxedProvider,
    encodings: HashMap<String, String>,
    reported: HashSet<String>,
    ext: ExtensionPoint,
    initialized: bool,
}

impl RepairProvider {
    pub fn new(child: BoxedProvider) -> Self {
        Self {
            child,
            encodings: HashMap::new(),
            reported: HashSet::new(),
            ext: ExtensionPoint::noop(),
            initialized: false,
        }
    }
}

#[async_trait]
impl DataProvider for RepairProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let result = self.child.initialize(ext.clone()).await?;
        self.encodings = result
            .topics
            .iter()
            .map(|t| (t.name.clone(), t.message_encoding.clone()))
            .collect();
        self.ext = ext;
        self.initialized = true;
        Ok(result)
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        if !self.initialized {
            return Err(ReplayError::NotInitialized(REPAIR_PROVIDER));
        }
        let mut events = self.child.get_messages(range, subscriptions).await?;
        for event in events.iter_mut() {
            let MessagePayload::Raw(bytes) = &mut event.payload else {
                continue;
            };
            let Some(encoding) = self.encodings.get(&event.topic) else {
                continue;
            };
            if let Some(repaired) = repair(encoding, bytes) {
                *bytes = repaired;
                if self.reported.insert(event.topic.clone()) {
                    log::warn!("Repaired malformed {} payloads on {}", encoding, event.topic);
                    self.ext.report_metadata(
                        METADATA_REPAIRED,
                        json!({ "topic": event.topic, "encoding": encoding }),
                    );
                }
            }
        }
        Ok(events)
    }

    async fn close(&mut self) -> Result<()> {
        self.child.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::MemoryProvider;
    use crate::time::Time;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_repair_json_strips_bom_and_padding() {
        let mut payload = UTF8_BOM.to_vec();
        payload.extend_from_slice(b"{\"x\":1}\n\0\0");
        assert_eq!(repair_json(&payload).unwrap(), b"{\"x\":1}");
        assert_eq!(repair_json(b"{\"x\":1}"), None);
    }

    #[test]
    fn test_unwrap_grpc_frame() {
        let body = [0x08, 0x96, 0x01];
        let mut framed = vec![0x00, 0x00, 0x00, 0x00, 0x03];
        framed.extend_from_slice(&body);
        assert_eq!(unwrap_grpc_frame(&framed), Some(&body[..]));
        // Length mismatch leaves the payload alone.
        framed.push(0x01);
        assert_eq!(unwrap_grpc_frame(&framed), None);
        assert_eq!(unwrap_grpc_frame(&body), None);
    }

    #[tokio::test]
    async fn test_repairs_and_reports_once_per_topic() {
        let mut child = MemoryProvider::new(&[("/a", 1, &[0, 1])]);
        for event in child.events.iter_mut() {
            if let MessagePayload::Raw(bytes) = &mut event.payload {
                bytes.extend_from_slice(b"\0\0");
            }
        }
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let ext = ExtensionPoint::new(|_| {}, move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value))
        });

        let mut provider = RepairProvider::new(Box::new(child));
        provider.initialize(ext).await.unwrap();
        let range = TimeRange::new(Time::ZERO, Time::from_millis(10)).unwrap();
        let events = provider
            .get_messages(range, &[Subscription::raw("/a")])
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        for event in &events {
            let value: serde_json::Value =
                serde_json::from_slice(event.payload.as_raw().unwrap()).unwrap();
            assert_eq!(value["topic"], "/a");
        }
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, METADATA_REPAIRED);
    }
}
