//! Rename stage: moves a child's topics under a namespace prefix.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use super::{BoxedProvider, DataProvider, RENAME_PROVIDER};
use crate::error::{ReplayError, Result};
use crate::time::TimeRange;
use crate::types::{ExtensionPoint, InitializationResult, MessageEvent, Subscription};

#[derive(Debug, Deserialize)]
pub(crate) struct RenameArgs {
    #[serde(default)]
    pub prefix: String,
}

/// A prefix is empty, or starts with `/` and does not end with one.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || (prefix.starts_with('/') && !prefix.ends_with('/')) {
        return Ok(());
    }
    Err(ReplayError::InvalidArgs {
        provider: RENAME_PROVIDER.into(),
        reason: format!("prefix '{prefix}' must start with '/' and not end with '/'"),
    })
}

/// Name of `topic` once moved under `prefix`.
pub fn prefixed_topic(prefix: &str, topic: &str) -> String {
    if prefix.is_empty() {
        topic.to_string()
    } else if topic.starts_with('/') {
        format!("{prefix}{topic}")
    } else {
        format!("{prefix}/{topic}")
    }
}

pub struct RenameProvider {
    child: BoxedProvider,
    prefix: String,
    /// Renamed topic to the child's name.
    to_child: HashMap<String, String>,
    /// Child's topic name to the renamed one.
    from_child: HashMap<String, String>,
}

impl RenameProvider {
    pub fn new(child: BoxedProvider, prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        Ok(Self {
            child,
            prefix: prefix.to_string(),
            to_child: HashMap::new(),
            from_child: HashMap::new(),
        })
    }
}

#[async_trait]
impl DataProvider for RenameProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        let mut result = self.child.initialize(ext).await?;
        for topic in result.topics.iter_mut() {
            let renamed = prefixed_topic(&self.prefix, &topic.name);
            self.to_child.insert(renamed.clone(), topic.name.clone());
            self.from_child.insert(topic.name.clone(), renamed.clone());
            topic.name = renamed;
        }
        if !self.prefix.is_empty() {
            log::info!(
                "Renamed {} topics under '{}'",
                result.topics.len(),
                self.prefix
            );
        }
        Ok(result)
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        let child_subscriptions: Vec<Subscription> = subscriptions
            .iter()
            .filter_map(|s| {
                self.to_child.get(&s.topic).map(|topic| Subscription {
                    topic: topic.clone(),
                    format: s.format,
                })
            })
            .collect();
        if child_subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = self.child.get_messages(range, &child_subscriptions).await?;
        for event in events.iter_mut() {
            if let Some(renamed) = self.from_child.get(&event.topic) {
                event.topic = renamed.clone();
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

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("/robot_b").is_ok());
        assert!(validate_prefix("robot_b").is_err());
        assert!(validate_prefix("/robot_b/").is_err());
        assert!(validate_prefix("/").is_err());
    }

    #[test]
    fn test_prefixed_topic() {
        assert_eq!(prefixed_topic("/b", "/imu"), "/b/imu");
        assert_eq!(prefixed_topic("/b", "imu"), "/b/imu");
        assert_eq!(prefixed_topic("", "/imu"), "/imu");
    }

    #[tokio::test]
    async fn test_renames_topics_and_events() {
        let child = MemoryProvider::new(&[("/imu", 1, &[0, 5]), ("/gps", 2, &[3])]);
        let mut provider = RenameProvider::new(Box::new(child), "/robot_b").unwrap();
        let init = provider.initialize(ExtensionPoint::noop()).await.unwrap();
        let names: Vec<_> = init.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["/robot_b/imu", "/robot_b/gps"]);

        let range = TimeRange::new(Time::ZERO, Time::from_millis(10)).unwrap();
        let events = provider
            .get_messages(
                range,
                &[Subscription::raw("/robot_b/imu"), Subscription::raw("/imu")],
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.topic == "/robot_b/imu"));
    }

    #[tokio::test]
    async fn test_unknown_topics_never_reach_child() {
        let child = MemoryProvider::new(&[("/imu", 1, &[0])]);
        let calls = child.calls.clone();
        let mut provider = RenameProvider::new(Box::new(child), "/b").unwrap();
        provider.initialize(ExtensionPoint::noop()).await.unwrap();
        let events = provider
            .get_messages(TimeRange::instant(Time::ZERO), &[Subscription::raw("/imu")])
            .await
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
