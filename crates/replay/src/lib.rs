//! Bubbaloop Replay
//!
//! Interactive playback of recorded MCAP telemetry. A composable tree of
//! data providers reads, repairs, decodes, renames, merges and caches log
//! records; the [`player::Player`] drives that tree with time-windowed fetches
//! and publishes ordered message batches as state snapshots.
//!
//! # Architecture
//!
//! ```text
//!            commands                      get_messages(range, subs)
//! client ──► Player ──► fetch task ──► cache ──► worker stub ═══► executor thread
//!   ▲          │                                                     │
//!   │          │ PlayerState                                         ▼
//!   └──────────┘                                    combine ──┬─► rename ─► parse ─► repair ─► mcap
//!                                                             └─► parse ─► repair ─► mcap
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration and the standard provider tree recipe.
//! - [`context`]: Explicit environment snapshot injected into construction.
//! - [`error`]: Unified error type for providers and the Player.
//! - [`player`]: Playback state machine, fetch scheduling and snapshots.
//! - [`provider`]: The `DataProvider` trait and every stage implementation.
//! - [`schema`]: Message definitions, payload decoders, header stamps.
//! - [`time`]: Log timestamps, inclusive ranges, seek specs.
//! - [`types`]: Records, topics, subscriptions and events.

pub mod config;
pub mod context;
pub mod error;
pub mod player;
pub mod provider;
pub mod schema;
pub mod time;
pub mod types;

pub use config::ReplayConfig;
pub use context::ReplayContext;
pub use error::{ReplayError, Result};
pub use player::{Player, PlayerHandle, PlayerState};
pub use provider::{build_provider, DataProvider};
pub use time::{Time, TimeRange};
pub use types::{MessageEvent, ProviderDescriptor, Subscription};
