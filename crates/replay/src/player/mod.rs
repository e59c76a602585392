//! Playback engine.
//!
//! A [`Player`] runs as one task. It owns the playback clock and talks to a
//! fetch task that owns the provider tree, keeping at most one
//! `get_messages` call outstanding. Seeks bump a generation counter; a
//! response carrying an older generation is dropped on arrival, and the
//! newest pending seek is issued as soon as the fetch task is free.
//!
//! ```text
//! PlayerHandle ──commands──► Player ──FetchRequest──► fetch task ──► provider tree
//!                              │  ◄──FetchResponse──      │
//!                              │  ◄──ProviderCallback─────┘
//!                              └──PlayerState──► listener
//! ```

mod fetcher;
pub mod state;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{PlaybackConfig, ReplayConfig};
use crate::context::ReplayContext;
use crate::error::{ReplayError, Result};
use crate::provider::{build_provider, BoxedProvider};
use crate::schema::MessageDefinition;
use crate::time::{Time, TimeRange};
use crate::types::{MessageEvent, Subscription, Topic, METADATA_REPAIRED, METADATA_WARNING};
use fetcher::{spawn_fetcher, FetchRequest, FetchResponse, Fetcher, ProviderCallback};

pub use state::{MessageOrder, PlayerState, PlayerStatus, PlayerWarning, PLAYBACK_SPEEDS};

/// Control messages accepted by a running Player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Initialize,
    Play,
    Pause,
    Seek(Time),
    SetSpeed(f64),
    SetSubscriptions(Vec<Subscription>),
    SetMessageOrder(MessageOrder),
    SetRepeat(bool),
    Close,
}

/// Cheap, cloneable control surface for a running Player.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    commands: flume::Sender<PlayerCommand>,
}

impl PlayerHandle {
    pub fn send(&self, command: PlayerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| ReplayError::Closed)
    }

    pub fn initialize(&self) -> Result<()> {
        self.send(PlayerCommand::Initialize)
    }

    pub fn play(&self) -> Result<()> {
        self.send(PlayerCommand::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(PlayerCommand::Pause)
    }

    pub fn seek(&self, time: Time) -> Result<()> {
        self.send(PlayerCommand::Seek(time))
    }

    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.send(PlayerCommand::SetSpeed(speed))
    }

    pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        self.send(PlayerCommand::SetSubscriptions(subscriptions))
    }

    pub fn set_message_order(&self, order: MessageOrder) -> Result<()> {
        self.send(PlayerCommand::SetMessageOrder(order))
    }

    pub fn set_repeat(&self, repeat: bool) -> Result<()> {
        self.send(PlayerCommand::SetRepeat(repeat))
    }

    pub fn close(&self) -> Result<()> {
        self.send(PlayerCommand::Close)
    }
}

/// A spawned Player: its handle, its snapshot stream and its task.
pub struct RunningPlayer {
    pub handle: PlayerHandle,
    pub states: flume::Receiver<PlayerState>,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    Seek,
    Window,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    generation: u64,
    kind: FetchKind,
}

pub struct Player {
    config: PlaybackConfig,
    status: PlayerStatus,
    speed: f64,
    repeat: bool,
    order: MessageOrder,
    resume_playing: bool,
    current_time: Time,
    range: TimeRange,
    topics: Vec<Topic>,
    datatypes: BTreeMap<String, MessageDefinition>,
    subscriptions: Vec<Subscription>,
    generation: u64,
    in_flight: Option<InFlight>,
    pending_seek: Option<Time>,
    last_advance: Instant,
    warnings: Vec<PlayerWarning>,
    progress: f64,
    fatal_error: Option<String>,
    total_bytes: u64,
    requests: flume::Sender<FetchRequest>,
    states: flume::Sender<PlayerState>,
}

impl Player {
    /// Start a Player over an already built provider tree.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(provider: BoxedProvider, config: PlaybackConfig) -> RunningPlayer {
        let (command_tx, command_rx) = flume::unbounded();
        let (state_tx, state_rx) = flume::unbounded();
        let fetcher = spawn_fetcher(provider);

        let player = Player {
            speed: config.speed,
            repeat: config.repeat,
            order: config.message_order,
            config,
            status: PlayerStatus::Uninitialized,
            resume_playing: false,
            current_time: Time::ZERO,
            range: TimeRange::instant(Time::ZERO),
            topics: Vec::new(),
            datatypes: BTreeMap::new(),
            subscriptions: Vec::new(),
            generation: 0,
            in_flight: None,
            pending_seek: None,
            last_advance: Instant::now(),
            warnings: Vec::new(),
            progress: 0.0,
            fatal_error: None,
            total_bytes: 0,
            requests: fetcher.requests.clone(),
            states: state_tx,
        };
        let task = tokio::spawn(player.run(command_rx, fetcher));

        RunningPlayer {
            handle: PlayerHandle {
                commands: command_tx,
            },
            states: state_rx,
            task,
        }
    }

    /// Build the configured provider tree and start a Player over it.
    pub fn from_config(config: &ReplayConfig, ctx: &ReplayContext) -> Result<RunningPlayer> {
        config.validate()?;
        let descriptor = config.provider_descriptor(ctx);
        let provider = build_provider(&descriptor, ctx)?;
        Ok(Self::spawn(provider, config.playback.clone()))
    }

    async fn run(mut self, commands: flume::Receiver<PlayerCommand>, fetcher: Fetcher) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.emit(Vec::new());

        loop {
            tokio::select! {
                command = commands.recv_async() => match command {
                    Ok(PlayerCommand::Close) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                response = fetcher.responses.recv_async() => match response {
                    Ok(response) => self.handle_response(response),
                    Err(_) => {
                        self.fail(ReplayError::Player("fetch task stopped".into()));
                    }
                },
                Ok(callback) = fetcher.callbacks.recv_async() => self.handle_callback(callback),
                _ = ticker.tick(), if self.status == PlayerStatus::Playing => self.on_tick(),
            }
            if self.status == PlayerStatus::Closed {
                break;
            }
        }

        self.shutdown(fetcher).await;
    }

    async fn shutdown(&mut self, fetcher: Fetcher) {
        self.status = PlayerStatus::Closed;
        self.resume_playing = false;
        if self.requests.send(FetchRequest::Close).is_ok() {
            while let Ok(response) = fetcher.responses.recv_async().await {
                if matches!(response, FetchResponse::Closed) {
                    break;
                }
            }
        }
        if let Err(e) = fetcher.task.await {
            log::warn!("Fetch task ended abnormally: {e}");
        }
        log::info!("Player closed");
        self.emit(Vec::new());
    }

    fn handle_command(&mut self, command: PlayerCommand) {
        log::debug!("Player command {:?} in {:?}", command, self.status);
        match command {
            PlayerCommand::Initialize => {
                if self.status != PlayerStatus::Uninitialized {
                    log::warn!("Ignoring initialize in {:?}", self.status);
                    return;
                }
                self.status = PlayerStatus::Initializing;
                self.request(FetchRequest::Initialize);
                self.emit(Vec::new());
            }
            PlayerCommand::Play => match self.status {
                PlayerStatus::Idle => {
                    if self.current_time >= self.range.end {
                        self.status = PlayerStatus::Playing;
                        self.seek_to(self.range.start);
                    } else {
                        self.status = PlayerStatus::Playing;
                        self.last_advance = Instant::now();
                        self.emit(Vec::new());
                    }
                }
                PlayerStatus::Seeking => {
                    self.resume_playing = true;
                    self.emit(Vec::new());
                }
                _ => {}
            },
            PlayerCommand::Pause => match self.status {
                PlayerStatus::Playing => {
                    self.status = PlayerStatus::Idle;
                    self.emit(Vec::new());
                }
                PlayerStatus::Seeking => {
                    self.resume_playing = false;
                    self.emit(Vec::new());
                }
                _ => {}
            },
            PlayerCommand::Seek(time) => match self.status {
                PlayerStatus::Idle | PlayerStatus::Playing | PlayerStatus::Seeking => {
                    self.seek_to(time)
                }
                _ => log::warn!("Ignoring seek in {:?}", self.status),
            },
            PlayerCommand::SetSpeed(speed) => {
                if !(speed.is_finite() && speed > 0.0) {
                    log::warn!("Ignoring invalid playback speed {speed}");
                    return;
                }
                self.speed = speed;
                self.emit(Vec::new());
            }
            PlayerCommand::SetSubscriptions(subscriptions) => {
                self.subscriptions = subscriptions;
            }
            PlayerCommand::SetMessageOrder(order) => {
                self.order = order;
                self.emit(Vec::new());
            }
            PlayerCommand::SetRepeat(repeat) => self.repeat = repeat,
            PlayerCommand::Close => {}
        }
    }

    fn seek_to(&mut self, time: Time) {
        let target = time.clamp_to(self.range.start, self.range.end);
        self.resume_playing = match self.status {
            PlayerStatus::Playing => true,
            PlayerStatus::Seeking => self.resume_playing,
            _ => false,
        };
        self.generation += 1;
        self.status = PlayerStatus::Seeking;
        self.current_time = target;
        self.pending_seek = Some(target);
        log::debug!("Seek to {} (generation {})", target, self.generation);
        self.dispatch_pending_seek();
        self.emit(Vec::new());
    }

    fn dispatch_pending_seek(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(target) = self.pending_seek.take() else {
            return;
        };
        let backfill = self.config.seek_backfill_ms.saturating_mul(1_000_000);
        let range = TimeRange {
            start: target.sub_nanos(backfill).max(self.range.start),
            end: target,
        };
        self.fetch(range, FetchKind::Seek);
    }

    fn on_tick(&mut self) {
        if self.in_flight.is_some() || self.pending_seek.is_some() {
            return;
        }
        if self.current_time >= self.range.end {
            self.reached_end();
            return;
        }
        let elapsed = self.last_advance.elapsed().as_nanos() as f64;
        let max_window = self.config.max_window_ms.saturating_mul(1_000_000) as f64;
        let window = (elapsed * self.speed).min(max_window) as u64;
        if window == 0 {
            return;
        }
        self.last_advance = Instant::now();
        let range = TimeRange {
            start: self.current_time.add_nanos(1),
            end: self.current_time.add_nanos(window).min(self.range.end),
        };
        self.fetch(range, FetchKind::Window);
    }

    fn fetch(&mut self, range: TimeRange, kind: FetchKind) {
        self.in_flight = Some(InFlight {
            generation: self.generation,
            kind,
        });
        self.request(FetchRequest::GetMessages {
            generation: self.generation,
            range,
            subscriptions: self.subscriptions.clone(),
        });
    }

    fn request(&mut self, request: FetchRequest) {
        if self.requests.send(request).is_err() {
            self.fail(ReplayError::Player("fetch task stopped".into()));
        }
    }

    fn reached_end(&mut self) {
        if self.repeat {
            log::debug!("Reached end, repeating from {}", self.range.start);
            self.seek_to(self.range.start);
        } else {
            self.status = PlayerStatus::Idle;
            self.emit(Vec::new());
        }
    }

    fn handle_response(&mut self, response: FetchResponse) {
        match response {
            FetchResponse::Initialized(Ok(result)) => {
                log::info!(
                    "Player initialized: {} topics, {}",
                    result.topics.len(),
                    result.time_range
                );
                self.topics = result.topics;
                self.datatypes = result.datatypes;
                self.range = result.time_range;
                self.current_time = result.time_range.start;
                self.status = PlayerStatus::Idle;
                self.seek_to(self.range.start);
            }
            FetchResponse::Initialized(Err(e)) => self.fail(e),
            FetchResponse::Messages {
                generation,
                range,
                result,
            } => {
                let Some(in_flight) = self.in_flight.take() else {
                    log::warn!("Unexpected fetch response for {range}");
                    return;
                };
                if generation != self.generation {
                    log::debug!("Discarding stale fetch for {range} (generation {generation})");
                    self.dispatch_pending_seek();
                    return;
                }
                self.apply_messages(in_flight.kind, range, result);
            }
            FetchResponse::Closed => {}
        }
    }

    fn apply_messages(
        &mut self,
        kind: FetchKind,
        range: TimeRange,
        result: Result<Vec<MessageEvent>>,
    ) {
        let mut events = match result {
            Ok(events) => events,
            Err(e) if e.is_fatal() => {
                self.fail(e);
                return;
            }
            Err(e) => {
                log::warn!("Fetch for {range} failed: {e}");
                self.warnings.push(PlayerWarning {
                    source: "player".into(),
                    topic: None,
                    message: e.to_string(),
                });
                if kind == FetchKind::Window {
                    // The clock stays put so the next tick asks for this window again.
                    self.emit(Vec::new());
                    return;
                }
                Vec::new()
            }
        };

        self.order.sort(&mut events);
        self.total_bytes += events
            .iter()
            .map(|e| e.serialized_size() as u64)
            .sum::<u64>();
        self.current_time = range.end;
        if kind == FetchKind::Seek {
            self.status = if self.resume_playing {
                PlayerStatus::Playing
            } else {
                PlayerStatus::Idle
            };
            self.resume_playing = false;
            self.last_advance = Instant::now();
        }
        self.emit(events);

        if self.status == PlayerStatus::Playing && self.current_time >= self.range.end {
            self.reached_end();
        }
    }

    fn handle_callback(&mut self, callback: ProviderCallback) {
        match callback {
            ProviderCallback::Progress(fraction) => self.progress = fraction,
            ProviderCallback::Metadata(key, value) if key == METADATA_WARNING => {
                let warning = PlayerWarning {
                    source: value["source"].as_str().unwrap_or("provider").to_string(),
                    topic: value["topic"].as_str().map(str::to_string),
                    message: value["message"].as_str().unwrap_or_default().to_string(),
                };
                log::warn!("{}: {}", warning.source, warning.message);
                self.warnings.push(warning);
                self.emit(Vec::new());
            }
            ProviderCallback::Metadata(key, value) if key == METADATA_REPAIRED => {
                log::info!("Repaired payloads: {value}");
            }
            ProviderCallback::Metadata(key, value) => {
                log::debug!("Provider metadata {key}: {value}");
            }
        }
    }

    fn fail(&mut self, error: ReplayError) {
        log::error!("Player fatal error: {error}");
        self.fatal_error = Some(error.to_string());
        self.status = PlayerStatus::Closed;
        self.resume_playing = false;
        self.emit(Vec::new());
    }

    fn snapshot(&self, messages: Vec<MessageEvent>) -> PlayerState {
        PlayerState {
            status: self.status,
            is_playing: self.status == PlayerStatus::Playing
                || (self.status == PlayerStatus::Seeking && self.resume_playing),
            speed: self.speed,
            current_time: self.current_time,
            start_time: self.range.start,
            end_time: self.range.end,
            topics: self.topics.clone(),
            datatypes: self.datatypes.clone(),
            messages,
            warnings: self.warnings.clone(),
            last_seek_time: self.generation,
            message_order: self.order,
            progress: self.progress,
            fatal_error: self.fatal_error.clone(),
            total_bytes_received: self.total_bytes,
        }
    }

    fn emit(&self, messages: Vec<MessageEvent>) {
        let _ = self.states.send(self.snapshot(messages));
    }
}
