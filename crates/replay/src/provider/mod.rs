//! Data provider tree.
//!
//! Every stage implements [`DataProvider`]. Stages own their children
//! outright and are assembled from a [`ProviderDescriptor`] by
//! [`build_provider`], which dispatches on the descriptor name.

pub mod combined;
pub mod mcap_source;
pub mod memory_cache;
pub mod parse;
pub mod rename;
pub mod repair;
pub mod rpc;
pub mod worker;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::ReplayContext;
use crate::error::{ReplayError, Result};
use crate::time::TimeRange;
use crate::types::{
    ExtensionPoint, InitializationResult, MessageEvent, ProviderDescriptor, Subscription,
};

pub use combined::CombinedProvider;
pub use mcap_source::McapSource;
pub use memory_cache::MemoryCacheProvider;
pub use parse::ParseProvider;
pub use rename::RenameProvider;
pub use repair::RepairProvider;
pub use worker::{WorkerExecutor, WorkerProvider};

pub const MCAP_PROVIDER: &str = "mcap";
pub const REPAIR_PROVIDER: &str = "repair";
pub const PARSE_PROVIDER: &str = "parse";
pub const RENAME_PROVIDER: &str = "rename";
pub const COMBINE_PROVIDER: &str = "combine";
pub const CACHE_PROVIDER: &str = "cache";
pub const WORKER_PROVIDER: &str = "worker";

/// A stage of the provider tree.
///
/// Methods take `&mut self`: a stage serves one call at a time, and any
/// bookkeeping it does between checking and updating its state is exclusive.
///
/// # Contract
///
/// - `initialize` is called once before anything else and fails if the
///   source is unusable.
/// - `get_messages` returns only events inside `range` (inclusive), in
///   ascending receive-time order, answering one of `subscriptions`.
/// - `close` releases resources and may be called more than once.
#[async_trait]
pub trait DataProvider: Send {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult>;

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxedProvider = Box<dyn DataProvider>;

/// Construct a provider tree from its recipe.
pub fn build_provider(
    descriptor: &ProviderDescriptor,
    ctx: &ReplayContext,
) -> Result<BoxedProvider> {
    log::debug!(
        "Building provider '{}' with {} children",
        descriptor.name,
        descriptor.children.len()
    );
    let provider: BoxedProvider = match descriptor.name.as_str() {
        MCAP_PROVIDER => {
            expect_children(descriptor, 0)?;
            let args: mcap_source::McapArgs = parse_args(descriptor)?;
            Box::new(McapSource::new(ctx.resolve_path(&args.path)))
        }
        REPAIR_PROVIDER => Box::new(RepairProvider::new(single_child(descriptor, ctx)?)),
        PARSE_PROVIDER => Box::new(ParseProvider::new(single_child(descriptor, ctx)?)),
        RENAME_PROVIDER => {
            let args: rename::RenameArgs = parse_args(descriptor)?;
            Box::new(RenameProvider::new(single_child(descriptor, ctx)?, &args.prefix)?)
        }
        COMBINE_PROVIDER => {
            if descriptor.children.is_empty() {
                return Err(invalid_args(descriptor, "needs at least one child"));
            }
            let args: combined::CombineArgs = parse_args(descriptor)?;
            let children = descriptor
                .children
                .iter()
                .map(|child| build_provider(child, ctx))
                .collect::<Result<Vec<_>>>()?;
            Box::new(CombinedProvider::with_offsets(children, args.offsets_ns)?)
        }
        CACHE_PROVIDER => {
            let args: memory_cache::CacheArgs = parse_args(descriptor)?;
            Box::new(MemoryCacheProvider::new(
                single_child(descriptor, ctx)?,
                args.budget_bytes,
                args.max_block_duration_ms,
            ))
        }
        WORKER_PROVIDER => {
            expect_children(descriptor, 1)?;
            Box::new(WorkerProvider::spawn(
                descriptor.children[0].clone(),
                ctx.clone(),
            )?)
        }
        other => return Err(ReplayError::UnknownProvider(other.to_string())),
    };
    Ok(provider)
}

fn single_child(descriptor: &ProviderDescriptor, ctx: &ReplayContext) -> Result<BoxedProvider> {
    expect_children(descriptor, 1)?;
    build_provider(&descriptor.children[0], ctx)
}

fn expect_children(descriptor: &ProviderDescriptor, count: usize) -> Result<()> {
    if descriptor.children.len() != count {
        return Err(invalid_args(
            descriptor,
            &format!(
                "expected {count} children, got {}",
                descriptor.children.len()
            ),
        ));
    }
    Ok(())
}

fn parse_args<T: DeserializeOwned>(descriptor: &ProviderDescriptor) -> Result<T> {
    let args = match &descriptor.args {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(args).map_err(|e| invalid_args(descriptor, &e.to_string()))
}

fn invalid_args(descriptor: &ProviderDescriptor, reason: &str) -> ReplayError {
    ReplayError::InvalidArgs {
        provider: descriptor.name.clone(),
        reason: reason.to_string(),
    }
}

/// Keep events inside `range` answering one of `subscriptions`.
pub(crate) fn retain_requested(
    events: &mut Vec<MessageEvent>,
    range: &TimeRange,
    subscriptions: &[Subscription],
) {
    events.retain(|event| range.contains(event.receive_time) && event.matches(subscriptions));
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory providers for stage unit tests.

    use super::*;
    use crate::schema::MessageDefinition;
    use crate::time::Time;
    use crate::types::Topic;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves a fixed list of raw events.
    pub struct MemoryProvider {
        pub topics: Vec<Topic>,
        pub datatypes: BTreeMap<String, MessageDefinition>,
        pub events: Vec<MessageEvent>,
        pub range: TimeRange,
        pub calls: Arc<AtomicUsize>,
        pub requests: Arc<std::sync::Mutex<Vec<TimeRange>>>,
        pub closes: Arc<AtomicUsize>,
        pub fail_close: bool,
    }

    impl MemoryProvider {
        /// `spec` is `(topic, channel_id, [receive times in ms])`.
        pub fn new(spec: &[(&str, u16, &[u64])]) -> Self {
            let mut topics = Vec::new();
            let mut events = Vec::new();
            for (topic, channel_id, times) in spec {
                topics.push(Topic {
                    name: topic.to_string(),
                    datatype: "test.Json".into(),
                    channel_id: *channel_id,
                    message_encoding: "json".into(),
                });
                for ms in times.iter() {
                    let body = serde_json::json!({ "topic": topic, "ms": ms });
                    events.push(MessageEvent::raw(
                        *topic,
                        Time::from_millis(*ms),
                        *channel_id,
                        serde_json::to_vec(&body).unwrap(),
                    ));
                }
            }
            events.sort_by_key(|e| (e.receive_time, e.channel_id));
            let start = events.first().map(|e| e.receive_time).unwrap_or(Time::ZERO);
            let end = events.last().map(|e| e.receive_time).unwrap_or(Time::ZERO);
            Self {
                topics,
                datatypes: BTreeMap::new(),
                events,
                range: TimeRange { start, end },
                calls: Arc::new(AtomicUsize::new(0)),
                requests: Arc::new(std::sync::Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
                fail_close: false,
            }
        }

        pub fn with_range(mut self, range: TimeRange) -> Self {
            self.range = range;
            self
        }
    }

    #[async_trait]
    impl DataProvider for MemoryProvider {
        async fn initialize(&mut self, _ext: ExtensionPoint) -> Result<InitializationResult> {
            Ok(InitializationResult {
                topics: self.topics.clone(),
                datatypes: self.datatypes.clone(),
                time_range: self.range,
            })
        }

        async fn get_messages(
            &mut self,
            range: TimeRange,
            subscriptions: &[Subscription],
        ) -> Result<Vec<MessageEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(range);
            let mut events = self.events.clone();
            retain_requested(&mut events, &range, subscriptions);
            Ok(events)
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                let topic = self.topics.first().map_or("", |t| t.name.as_str());
                return Err(ReplayError::Remote(format!("close refused by {topic}")));
            }
            Ok(())
        }
    }
}
