//! Block-based memory cache in front of a subtree.
//!
//! Fetched ranges are kept as disjoint blocks keyed by start time. A request
//! only reaches the child for the parts of its range no block covers; the
//! answer is assembled from blocks clipped to the request. Blocks are
//! evicted least-recently-used first once their serialized size exceeds the
//! byte budget, except blocks overlapping the request being served.
//!
//! Blocks belong to one subscription set. A request for topics outside the
//! current set drops every block and widens the set, so a block never holds
//! a partial answer.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use super::{retain_requested, BoxedProvider, DataProvider, CACHE_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::time::{Time, TimeRange};
use crate::types::{ExtensionPoint, InitializationResult, MessageEvent, Subscription};

pub const DEFAULT_BUDGET_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_BLOCK_DURATION_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheArgs {
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: u64,
    #[serde(default = "default_max_block_duration_ms")]
    pub max_block_duration_ms: u64,
}

fn default_budget_bytes() -> u64 {
    DEFAULT_BUDGET_BYTES
}

fn default_max_block_duration_ms() -> u64 {
    DEFAULT_MAX_BLOCK_DURATION_MS
}

#[derive(Debug)]
struct CacheBlock {
    range: TimeRange,
    events: Vec<MessageEvent>,
    bytes: u64,
    last_access: u64,
}

fn events_bytes(events: &[MessageEvent]) -> u64 {
    events.iter().map(|e| e.serialized_size() as u64).sum()
}

pub struct MemoryCacheProvider {
    child: BoxedProvider,
    budget_bytes: u64,
    max_block_nanos: u64,
    blocks: BTreeMap<Time, CacheBlock>,
    total_bytes: u64,
    tick: u64,
    subscriptions: BTreeSet<Subscription>,
    source_range: Option<TimeRange>,
    ext: ExtensionPoint,
}

impl MemoryCacheProvider {
    pub fn new(child: BoxedProvider, budget_bytes: u64, max_block_duration_ms: u64) -> Self {
        Self {
            child,
            budget_bytes,
            max_block_nanos: max_block_duration_ms.saturating_mul(1_000_000),
            blocks: BTreeMap::new(),
            total_bytes: 0,
            tick: 0,
            subscriptions: BTreeSet::new(),
            source_range: None,
            ext: ExtensionPoint::noop(),
        }
    }

    /// Ranges currently held, in time order.
    pub fn blocks(&self) -> Vec<TimeRange> {
        self.blocks.values().map(|b| b.range).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.total_bytes = 0;
    }

    /// Keys of blocks overlapping `range`, in time order.
    fn overlapping(&self, range: &TimeRange) -> Vec<Time> {
        let before = self
            .blocks
            .range(..range.start)
            .next_back()
            .filter(|(_, block)| block.range.overlaps(range))
            .map(|(key, _)| *key);
        before
            .into_iter()
            .chain(self.blocks.range(range.start..=range.end).map(|(key, _)| *key))
            .collect()
    }

    /// Parts of `range` no block covers.
    fn gaps(&self, range: &TimeRange) -> Vec<TimeRange> {
        let mut gaps = Vec::new();
        let mut cursor = Some(range.start);
        for key in self.overlapping(range) {
            let covered = self.blocks[&key].range;
            if let Some(start) = cursor {
                if covered.start > start {
                    gaps.push(TimeRange {
                        start,
                        end: covered.start.sub_nanos(1),
                    });
                }
            }
            cursor = (covered.end < range.end).then(|| covered.end.add_nanos(1));
            if cursor.is_none() {
                break;
            }
        }
        if let Some(start) = cursor {
            if start <= range.end {
                gaps.push(TimeRange {
                    start,
                    end: range.end,
                });
            }
        }
        gaps
    }

    fn can_merge(&self, a: &TimeRange, b: &TimeRange) -> bool {
        a.touches(b) && a.union(b).duration_nanos() <= self.max_block_nanos
    }

    /// Insert a freshly fetched block, merging it with touching neighbours.
    fn insert_block(&mut self, range: TimeRange, events: Vec<MessageEvent>) {
        let bytes = events_bytes(&events);
        let mut block = CacheBlock {
            range,
            events,
            bytes,
            last_access: self.tick,
        };
        self.total_bytes += bytes;

        let previous = self
            .blocks
            .range(..range.start)
            .next_back()
            .map(|(key, b)| (*key, b.range));
        if let Some((key, previous_range)) = previous {
            if self.can_merge(&previous_range, &block.range) {
                if let Some(mut previous) = self.blocks.remove(&key) {
                    previous.events.append(&mut block.events);
                    block = CacheBlock {
                        range: previous.range.union(&block.range),
                        events: previous.events,
                        bytes: previous.bytes + block.bytes,
                        last_access: self.tick,
                    };
                }
            }
        }

        let next = self
            .blocks
            .range(block.range.start..)
            .next()
            .map(|(key, b)| (*key, b.range));
        if let Some((key, next_range)) = next {
            if self.can_merge(&block.range, &next_range) {
                if let Some(mut next) = self.blocks.remove(&key) {
                    block.events.append(&mut next.events);
                    block.range = block.range.union(&next.range);
                    block.bytes += next.bytes;
                }
            }
        }

        self.blocks.insert(block.range.start, block);
    }

    /// Drop least-recently-used blocks outside `protected` until under budget.
    fn evict(&mut self, protected: &TimeRange) {
        while self.total_bytes > self.budget_bytes {
            let victim = self
                .blocks
                .iter()
                .filter(|(_, block)| !block.range.overlaps(protected))
                .min_by_key(|(_, block)| block.last_access)
                .map(|(key, _)| *key);
            let Some(key) = victim else {
                log::warn!(
                    "Cache over budget ({} > {} bytes) with only in-flight blocks left",
                    self.total_bytes,
                    self.budget_bytes
                );
                break;
            };
            if let Some(block) = self.blocks.remove(&key) {
                log::debug!("Evicting cache block {} ({} bytes)", block.range, block.bytes);
                self.total_bytes = self.total_bytes.saturating_sub(block.bytes);
            }
        }
    }

    fn report_progress(&self) {
        let Some(source) = self.source_range else {
            return;
        };
        let span = source.duration_nanos();
        let covered: u64 = self.blocks.values().map(|b| b.range.duration_nanos()).sum();
        let fraction = if span == 0 {
            if self.blocks.is_empty() {
                0.0
            } else {
                1.0
            }
        } else {
            covered as f64 / span as f64
        };
        self.ext.progress(fraction);
    }
}

#[async_trait]
impl DataProvider for MemoryCacheProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let forward = ext.clone();
        let child_ext = ExtensionPoint::new(
            |_| {},
            move |key, value| forward.report_metadata(key, value),
        );
        let result = self.child.initialize(child_ext).await?;
        self.source_range = Some(result.time_range);
        self.ext = ext;
        self.report_progress();
        log::info!(
            "Memory cache over {} with a {} byte budget",
            result.time_range,
            self.budget_bytes
        );
        Ok(result)
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        let source = self
            .source_range
            .ok_or(ReplayError::NotInitialized(CACHE_PROVIDER))?;
        let Some(range) = range.intersect(&source) else {
            return Ok(Vec::new());
        };
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        if !subscriptions.iter().all(|s| self.subscriptions.contains(s)) {
            if !self.blocks.is_empty() {
                log::debug!("Subscriptions widened; dropping {} cache blocks", self.blocks.len());
            }
            self.clear();
            self.subscriptions.extend(subscriptions.iter().cloned());
        }
        let cached_subscriptions: Vec<Subscription> = self.subscriptions.iter().cloned().collect();

        self.tick += 1;
        let gaps = self.gaps(&range);
        for gap in gaps {
            log::debug!("Cache miss for {gap}");
            let events = self.child.get_messages(gap, &cached_subscriptions).await?;
            self.insert_block(gap, events);
        }

        let mut events = Vec::new();
        for key in self.overlapping(&range) {
            if let Some(block) = self.blocks.get_mut(&key) {
                block.last_access = self.tick;
                events.extend(
                    block
                        .events
                        .iter()
                        .filter(|e| range.contains(e.receive_time))
                        .cloned(),
                );
            }
        }
        retain_requested(&mut events, &range, subscriptions);

        self.evict(&range);
        self.report_progress();
        Ok(events)
    }

    async fn close(&mut self) -> Result<()> {
        self.clear();
        self.child.close().await
    }
}
