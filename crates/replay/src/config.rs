use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::context::ReplayContext;
use crate::error::{ReplayError, Result};
use crate::player::MessageOrder;
use crate::provider::memory_cache::{DEFAULT_BUDGET_BYTES, DEFAULT_MAX_BLOCK_DURATION_MS};
use crate::provider::{
    CACHE_PROVIDER, COMBINE_PROVIDER, MCAP_PROVIDER, PARSE_PROVIDER, RENAME_PROVIDER,
    REPAIR_PROVIDER, WORKER_PROVIDER,
};
use crate::types::ProviderDescriptor;

/// Prefix given to the second source when none is configured; later sources
/// follow the same `/replay_source_<n>` pattern.
pub const SECOND_SOURCE_PREFIX: &str = "/replay_source_2";

/// Replay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Log files to play back together.
    pub sources: Vec<SourceConfig>,

    /// Decode on a separate worker thread behind the RPC boundary.
    #[serde(default = "default_worker")]
    pub worker: bool,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// One recorded log.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// MCAP file path; relative paths resolve against the data directory.
    pub path: PathBuf,

    /// Topic namespace prefix, e.g. `/robot_b`.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Memory cache sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for decoded messages held in memory.
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: u64,

    /// Adjacent blocks stop merging past this span.
    #[serde(default = "default_max_block_duration_ms")]
    pub max_block_duration_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: default_budget_bytes(),
            max_block_duration_ms: default_max_block_duration_ms(),
        }
    }
}

/// Player tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Seek back to the start when playback reaches the end.
    #[serde(default)]
    pub repeat: bool,

    #[serde(default)]
    pub message_order: MessageOrder,

    /// Wall-clock interval between fetch windows while playing.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Upper bound on one fetch window, in log milliseconds.
    #[serde(default = "default_max_window_ms")]
    pub max_window_ms: u64,

    /// How far before a seek target messages are fetched.
    #[serde(default = "default_seek_backfill_ms")]
    pub seek_backfill_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            repeat: false,
            message_order: MessageOrder::default(),
            tick_interval_ms: default_tick_interval_ms(),
            max_window_ms: default_max_window_ms(),
            seek_backfill_ms: default_seek_backfill_ms(),
        }
    }
}

fn default_worker() -> bool {
    true
}

fn default_budget_bytes() -> u64 {
    DEFAULT_BUDGET_BYTES
}

fn default_max_block_duration_ms() -> u64 {
    DEFAULT_MAX_BLOCK_DURATION_MS
}

fn default_speed() -> f64 {
    1.0
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_max_window_ms() -> u64 {
    300
}

fn default_seek_backfill_ms() -> u64 {
    150
}

impl ReplayConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReplayError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ReplayError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a single file with default settings.
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            sources: vec![SourceConfig {
                path: path.into(),
                prefix: None,
            }],
            worker: default_worker(),
            cache: CacheConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(ReplayError::Config("at least one source is required".into()));
        }
        if !(self.playback.speed.is_finite() && self.playback.speed > 0.0) {
            return Err(ReplayError::Config(format!(
                "playback speed must be positive, got {}",
                self.playback.speed
            )));
        }
        if self.playback.tick_interval_ms == 0 {
            return Err(ReplayError::Config("tick_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Prefix applied to source `index`, if any.
    pub fn source_prefix(&self, index: usize) -> Option<String> {
        let source = self.sources.get(index)?;
        match &source.prefix {
            Some(prefix) if prefix.is_empty() => None,
            Some(prefix) => Some(prefix.clone()),
            None if index > 0 && self.sources.len() > 1 => {
                Some(format!("/replay_source_{}", index + 1))
            }
            None => None,
        }
    }

    /// Build the provider tree recipe for these sources.
    ///
    /// ```text
    /// cache ─► worker ─► combine ─┬─► rename ─► parse ─► repair ─► mcap
    ///                             └─► rename ─► parse ─► repair ─► mcap
    /// ```
    ///
    /// `worker` is omitted when disabled, `combine` when there is one source,
    /// and `rename` for sources without a prefix.
    pub fn provider_descriptor(&self, ctx: &ReplayContext) -> ProviderDescriptor {
        let mut sources: Vec<ProviderDescriptor> = self
            .sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let leaf = ProviderDescriptor::new(
                    MCAP_PROVIDER,
                    json!({ "path": source.path.to_string_lossy() }),
                );
                let parsed = ProviderDescriptor::new(PARSE_PROVIDER, json!({})).with_child(
                    ProviderDescriptor::new(REPAIR_PROVIDER, json!({})).with_child(leaf),
                );
                match self.source_prefix(index) {
                    Some(prefix) => {
                        ProviderDescriptor::new(RENAME_PROVIDER, json!({ "prefix": prefix }))
                            .with_child(parsed)
                    }
                    None => parsed,
                }
            })
            .collect();

        let mut root = if sources.len() == 1 {
            sources.remove(0)
        } else {
            ProviderDescriptor::new(COMBINE_PROVIDER, json!({})).with_children(sources)
        };

        if self.worker {
            root = ProviderDescriptor::new(WORKER_PROVIDER, json!({})).with_child(root);
        }

        let budget_bytes = ctx
            .cache_budget_override()
            .unwrap_or(self.cache.budget_bytes);
        ProviderDescriptor::new(
            CACHE_PROVIDER,
            json!({
                "budgetBytes": budget_bytes,
                "maxBlockDurationMs": self.cache.max_block_duration_ms,
            }),
        )
        .with_child(root)
    }
}
