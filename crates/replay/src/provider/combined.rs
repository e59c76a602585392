//! Combinator stage: merges several subtrees into one timeline.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use super::{BoxedProvider, DataProvider, COMBINE_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::time::{Time, TimeRange};
use crate::types::{ExtensionPoint, InitializationResult, MessageEvent, Subscription};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CombineArgs {
    /// Per-child shift into the shared timeline.
    #[serde(default)]
    pub offsets_ns: Vec<i64>,
}

/// Merges children whose topic namespaces are disjoint.
///
/// Each child may be shifted by a fixed nanosecond offset. Results are merged
/// by receive time; ties go to the lower channel id, then the earlier child.
pub struct CombinedProvider {
    children: Vec<BoxedProvider>,
    offsets: Vec<i64>,
    owners: HashMap<String, usize>,
    initialized: bool,
}

impl CombinedProvider {
    pub fn new(children: Vec<BoxedProvider>) -> Self {
        let offsets = vec![0; children.len()];
        Self {
            children,
            offsets,
            owners: HashMap::new(),
            initialized: false,
        }
    }

    pub fn with_offsets(children: Vec<BoxedProvider>, offsets_ns: Vec<i64>) -> Result<Self> {
        if offsets_ns.is_empty() {
            return Ok(Self::new(children));
        }
        if offsets_ns.len() != children.len() {
            return Err(ReplayError::InvalidArgs {
                provider: COMBINE_PROVIDER.into(),
                reason: format!(
                    "{} offsets for {} children",
                    offsets_ns.len(),
                    children.len()
                ),
            });
        }
        let mut provider = Self::new(children);
        provider.offsets = offsets_ns;
        Ok(provider)
    }
}

/// k-way merge of per-child sorted batches.
fn merge_sorted(batches: Vec<(usize, Vec<MessageEvent>)>) -> Vec<MessageEvent> {
    let total = batches.iter().map(|(_, events)| events.len()).sum();
    let mut cursors: Vec<std::vec::IntoIter<MessageEvent>> = Vec::with_capacity(batches.len());
    let mut heads: Vec<Option<MessageEvent>> = Vec::with_capacity(batches.len());
    let mut heap: BinaryHeap<Reverse<(Time, u16, usize, usize)>> = BinaryHeap::new();

    for (slot, (child, events)) in batches.into_iter().enumerate() {
        let mut iter = events.into_iter();
        let head = iter.next();
        if let Some(event) = &head {
            heap.push(Reverse((event.receive_time, event.channel_id, child, slot)));
        }
        cursors.push(iter);
        heads.push(head);
    }

    let mut merged = Vec::with_capacity(total);
    while let Some(Reverse((_, _, child, slot))) = heap.pop() {
        let Some(event) = heads[slot].take() else {
            continue;
        };
        merged.push(event);
        if let Some(next) = cursors[slot].next() {
            heap.push(Reverse((next.receive_time, next.channel_id, child, slot)));
            heads[slot] = Some(next);
        }
    }
    merged
}

#[async_trait]
impl DataProvider for CombinedProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let results = try_join_all(
            self.children
                .iter_mut()
                .map(|child| child.initialize(ext.clone())),
        )
        .await?;

        let mut topics = Vec::new();
        let mut datatypes = BTreeMap::new();
        let mut time_range: Option<TimeRange> = None;
        self.owners.clear();

        for (index, result) in results.into_iter().enumerate() {
            for topic in result.topics {
                if self.owners.insert(topic.name.clone(), index).is_some() {
                    return Err(ReplayError::TopicCollision(topic.name));
                }
                topics.push(topic);
            }
            for (name, definition) in result.datatypes {
                match datatypes.get(&name) {
                    Some(existing) if existing != &definition => {
                        log::warn!("Datatype '{name}' differs between sources; keeping the first");
                    }
                    Some(_) => {}
                    None => {
                        datatypes.insert(name, definition);
                    }
                }
            }
            let shifted = result.time_range.shift(self.offsets[index]);
            time_range = Some(match time_range {
                Some(range) => range.union(&shifted),
                None => shifted,
            });
        }

        let time_range = time_range.unwrap_or_else(|| TimeRange::instant(Time::ZERO));
        log::info!(
            "Combined {} sources: {} topics, {}",
            self.children.len(),
            topics.len(),
            time_range
        );
        self.initialized = true;
        Ok(InitializationResult {
            topics,
            datatypes,
            time_range,
        })
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        if !self.initialized {
            return Err(ReplayError::NotInitialized(COMBINE_PROVIDER));
        }

        let mut requests: Vec<Vec<Subscription>> = vec![Vec::new(); self.children.len()];
        for subscription in subscriptions {
            if let Some(owner) = self.owners.get(&subscription.topic) {
                requests[*owner].push(subscription.clone());
            }
        }

        let offsets = &self.offsets;
        let fetches = self
            .children
            .iter_mut()
            .zip(requests.iter())
            .enumerate()
            .filter(|(_, (_, subs))| !subs.is_empty())
            .map(|(index, (child, subs))| {
                let offset = offsets[index];
                async move {
                    let mut events = child.get_messages(range.shift(-offset), subs).await?;
                    if offset != 0 {
                        for event in events.iter_mut() {
                            event.receive_time = event.receive_time.offset(offset);
                            event.header_stamp = event.header_stamp.map(|t| t.offset(offset));
                        }
                        events.retain(|e| range.contains(e.receive_time));
                    }
                    Ok::<_, ReplayError>((index, events))
                }
            });
        let batches = try_join_all(fetches).await?;
        Ok(merge_sorted(batches))
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (index, child) in self.children.iter_mut().enumerate() {
            if let Err(e) = child.close().await {
                log::warn!("Closing source {index} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
