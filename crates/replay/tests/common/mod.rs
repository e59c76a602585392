//! Test helpers for replay integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bubbaloop_replay::player::PlayerState;
use bubbaloop_replay::provider::{BoxedProvider, DataProvider};
use bubbaloop_replay::types::{ExtensionPoint, InitializationResult, Topic};
use bubbaloop_replay::{
    MessageEvent, ProviderDescriptor, ReplayError, Result, Subscription, Time, TimeRange,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const JSON_SCHEMA: &[u8] =
    br#"{"type":"object","properties":{"topic":{"type":"string"},"ms":{"type":"number"}}}"#;

/// Write an MCAP file with one json channel per topic.
///
/// Each entry is `(topic, receive times in ms)`; the payload is
/// `{"topic": .., "ms": ..}`.
pub fn write_json_mcap(path: &Path, topics: &[(&str, &[u64])]) {
    let stamped: Vec<(&str, Vec<(u64, Option<u64>)>)> = topics
        .iter()
        .map(|(topic, times)| (*topic, times.iter().map(|ms| (*ms, None)).collect()))
        .collect();
    let borrowed: Vec<(&str, &[(u64, Option<u64>)])> = stamped
        .iter()
        .map(|(topic, times)| (*topic, times.as_slice()))
        .collect();
    write_stamped_mcap(path, &borrowed);
}

/// Like [`write_json_mcap`], with an optional `header.stamp` (ms) per message.
pub fn write_stamped_mcap(path: &Path, topics: &[(&str, &[(u64, Option<u64>)])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = mcap::Writer::new(std::io::BufWriter::new(file)).unwrap();
    let schema_id = writer.add_schema("test.Json", "jsonschema", JSON_SCHEMA).unwrap();

    let mut records = Vec::new();
    for (topic, times) in topics {
        let channel_id = writer
            .add_channel(schema_id as u16, topic, "json", &BTreeMap::new())
            .unwrap();
        for (ms, stamp) in times.iter() {
            let mut body = json!({ "topic": topic, "ms": ms });
            if let Some(stamp) = stamp {
                body["header"] = json!({
                    "stamp": { "sec": stamp / 1000, "nsec": (stamp % 1000) * 1_000_000 }
                });
            }
            records.push((*ms, channel_id, serde_json::to_vec(&body).unwrap()));
        }
    }
    records.sort_by_key(|(ms, channel_id, _)| (*ms, *channel_id));

    for (sequence, (ms, channel_id, body)) in records.into_iter().enumerate() {
        let header = mcap::records::MessageHeader {
            channel_id,
            sequence: sequence as u32,
            log_time: ms * 1_000_000,
            publish_time: ms * 1_000_000,
        };
        writer.write_to_known_channel(&header, &body).unwrap();
    }
    writer.finish().unwrap();
}

/// `parse → repair → mcap` over one file.
pub fn decode_tree(path: &Path) -> ProviderDescriptor {
    ProviderDescriptor::new("parse", json!({})).with_child(
        ProviderDescriptor::new("repair", json!({}))
            .with_child(ProviderDescriptor::new("mcap", json!({ "path": path }))),
    )
}

pub fn range_ms(start: u64, end: u64) -> TimeRange {
    TimeRange::new(Time::from_millis(start), Time::from_millis(end)).unwrap()
}

pub fn millis(event: &MessageEvent) -> u64 {
    event.receive_time.to_nanos() / 1_000_000
}

/// Serves a fixed list of raw json events and records every request.
pub struct MemoryProvider {
    topics: Vec<Topic>,
    events: Vec<MessageEvent>,
    range: TimeRange,
    pub requests: Arc<Mutex<Vec<TimeRange>>>,
    pub subscriptions: Arc<Mutex<Vec<Vec<Subscription>>>>,
}

impl MemoryProvider {
    /// Each entry is `(topic, channel id, receive times in ms)`.
    pub fn new(topics: &[(&str, u16, &[u64])]) -> Self {
        let mut events = Vec::new();
        let topics = topics
            .iter()
            .map(|(topic, channel_id, times)| {
                for ms in times.iter() {
                    let body = json!({ "topic": topic, "ms": ms });
                    events.push(MessageEvent::raw(
                        *topic,
                        Time::from_millis(*ms),
                        *channel_id,
                        serde_json::to_vec(&body).unwrap(),
                    ));
                }
                Topic {
                    name: topic.to_string(),
                    datatype: "test.Json".into(),
                    channel_id: *channel_id,
                    message_encoding: "json".into(),
                }
            })
            .collect();
        events.sort_by_key(|e| (e.receive_time, e.channel_id));
        let start = events.first().map_or(Time::ZERO, |e| e.receive_time);
        let end = events.last().map_or(Time::ZERO, |e| e.receive_time);
        Self {
            topics,
            events,
            range: TimeRange { start, end },
            requests: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    async fn initialize(&mut self, _ext: ExtensionPoint) -> Result<InitializationResult> {
        Ok(InitializationResult {
            topics: self.topics.clone(),
            datatypes: BTreeMap::new(),
            time_range: self.range,
        })
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        self.requests.lock().unwrap().push(range);
        self.subscriptions
            .lock()
            .unwrap()
            .push(subscriptions.to_vec());
        Ok(self
            .events
            .iter()
            .filter(|e| range.contains(e.receive_time) && e.matches(subscriptions))
            .cloned()
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counts `get_messages` calls reaching the wrapped provider.
pub struct CountingProvider {
    inner: BoxedProvider,
    pub calls: Arc<AtomicUsize>,
}

impl CountingProvider {
    pub fn new(inner: BoxedProvider) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl DataProvider for CountingProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        self.inner.initialize(ext).await
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_messages(range, subscriptions).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Holds every `get_messages` call until a permit arrives, once armed.
pub struct GatedProvider {
    inner: BoxedProvider,
    armed: Arc<AtomicBool>,
    held: Arc<AtomicUsize>,
    permits: flume::Receiver<()>,
}

/// Test side of a [`GatedProvider`]. Dropping every clone opens the gate.
#[derive(Clone)]
pub struct Gate {
    armed: Arc<AtomicBool>,
    held: Arc<AtomicUsize>,
    permits: flume::Sender<()>,
}

impl Gate {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until `calls` requests have reached the gate since it was built.
    pub async fn wait_held(&self, calls: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.held.load(Ordering::SeqCst) < calls {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("timed out waiting for a held request")
    }

    pub fn release(&self, calls: usize) {
        for _ in 0..calls {
            self.permits.send(()).unwrap();
        }
    }
}

impl GatedProvider {
    pub fn new(inner: BoxedProvider) -> (Self, Gate) {
        let armed = Arc::new(AtomicBool::new(false));
        let held = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::unbounded();
        let gate = Gate {
            armed: armed.clone(),
            held: held.clone(),
            permits: tx,
        };
        (
            Self {
                inner,
                armed,
                held,
                permits: rx,
            },
            gate,
        )
    }
}

#[async_trait]
impl DataProvider for GatedProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        self.inner.initialize(ext).await
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        if self.armed.load(Ordering::SeqCst) {
            self.held.fetch_add(1, Ordering::SeqCst);
            let _ = self.permits.recv_async().await;
        }
        self.inner.get_messages(range, subscriptions).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Fails one `get_messages` call (0-based) with a recoverable error.
pub struct FlakyProvider {
    inner: BoxedProvider,
    fail_call: usize,
    calls: usize,
}

impl FlakyProvider {
    pub fn new(inner: BoxedProvider, fail_call: usize) -> Self {
        Self {
            inner,
            fail_call,
            calls: 0,
        }
    }
}

#[async_trait]
impl DataProvider for FlakyProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        self.inner.initialize(ext).await
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        let call = self.calls;
        self.calls += 1;
        if call == self.fail_call {
            return Err(ReplayError::Remote(format!("lost connection fetching {range}")));
        }
        self.inner.get_messages(range, subscriptions).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Wait until at least `count` requests have been recorded.
pub async fn wait_for_requests(requests: &Arc<Mutex<Vec<TimeRange>>>, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while requests.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for provider requests")
}

/// Wait for the next snapshot matching `predicate`, collecting every
/// snapshot seen on the way (the match included).
pub async fn collect_until(
    states: &flume::Receiver<PlayerState>,
    predicate: impl Fn(&PlayerState) -> bool,
) -> Vec<PlayerState> {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        loop {
            let state = states.recv_async().await.unwrap();
            let done = predicate(&state);
            seen.push(state);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("timed out waiting for player state")
}

pub async fn next_matching(
    states: &flume::Receiver<PlayerState>,
    predicate: impl Fn(&PlayerState) -> bool,
) -> PlayerState {
    collect_until(states, predicate).await.pop().unwrap()
}
