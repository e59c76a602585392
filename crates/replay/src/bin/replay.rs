use argh::FromArgs;
use bubbaloop_replay::player::{PlayerState, PlayerStatus};
use bubbaloop_replay::time::{parse_time_str, seek_time_from_spec, SeekToTimeSpec};
use bubbaloop_replay::types::ExtensionPoint;
use bubbaloop_replay::{
    build_provider, Player, ReplayConfig, ReplayContext, Subscription, TimeRange,
};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Replay recorded MCAP telemetry
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Info(InfoArgs),
    Play(PlayArgs),
}

/// Print topics, datatypes and time range of a recording
#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
struct InfoArgs {
    /// MCAP file to inspect
    #[argh(positional)]
    file: PathBuf,

    /// decode on the calling thread instead of a worker
    #[argh(switch)]
    no_worker: bool,
}

/// Play a recording and print delivered messages as JSON lines
#[derive(FromArgs)]
#[argh(subcommand, name = "play")]
struct PlayArgs {
    /// path to the replay configuration file
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// topic to subscribe to (repeatable, default: all topics)
    #[argh(option, short = 't')]
    topic: Vec<String>,

    /// deliver raw payloads instead of decoded messages
    #[argh(switch)]
    raw: bool,

    /// playback speed factor
    #[argh(option)]
    speed: Option<f64>,

    /// restart from the beginning when the end is reached
    #[argh(switch)]
    repeat: bool,

    /// start time: SEC.NSEC, +SEC from the start, -SEC from the end or
    /// PERCENT% (default: start of the recording)
    #[argh(option)]
    seek: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();
    let ctx = ReplayContext::from_env();

    match args.command {
        Command::Info(args) => info(args, &ctx).await,
        Command::Play(args) => play(args, &ctx).await,
    }
}

async fn info(args: InfoArgs, ctx: &ReplayContext) -> anyhow::Result<()> {
    let mut config = ReplayConfig::for_file(args.file.clone());
    config.worker = !args.no_worker;

    let mut provider = build_provider(&config.provider_descriptor(ctx), ctx)?;
    let result = provider.initialize(ExtensionPoint::noop()).await;
    provider.close().await?;
    let result = result?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn play(args: PlayArgs, ctx: &ReplayContext) -> anyhow::Result<()> {
    let mut config = ReplayConfig::load(&args.config)?;
    if let Some(speed) = args.speed {
        config.playback.speed = speed;
    }
    config.playback.repeat |= args.repeat;
    config.validate()?;

    let seek = match args.seek.as_deref() {
        Some(raw) => Some(
            parse_seek(raw).ok_or_else(|| anyhow::anyhow!("Invalid seek time: {raw}"))?,
        ),
        None => None,
    };

    let shutdown_tx = tokio::sync::watch::Sender::new(());
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            if let Err(e) = shutdown_tx.send(()) {
                log::warn!("Failed to send shutdown signal: {}", e);
            }
        }
    })?;
    let mut shutdown_rx = shutdown_tx.subscribe();

    let player = Player::from_config(&config, ctx)?;
    player.handle.initialize()?;

    // Subscriptions depend on the topic list, so wait for initialization.
    let initial = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                player.handle.close()?;
                player.task.await?;
                return Ok(());
            }
            state = player.states.recv_async() => {
                let state = state?;
                if let Some(error) = &state.fatal_error {
                    anyhow::bail!("Failed to open recording: {error}");
                }
                if state.status == PlayerStatus::Idle {
                    break state;
                }
            }
        }
    };

    let subscriptions = subscriptions_for(&initial, &args.topic, args.raw);
    log::info!(
        "Playing {} topics over [{}, {}] at {}x",
        subscriptions.len(),
        initial.start_time,
        initial.end_time,
        config.playback.speed
    );
    player.handle.set_subscriptions(subscriptions)?;
    let range = TimeRange {
        start: initial.start_time,
        end: initial.end_time,
    };
    let target = seek.map_or(range.start, |spec| seek_time_from_spec(spec, range));
    player.handle.seek(target)?;
    player.handle.play()?;

    let mut started = false;
    let mut delivered = 0usize;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            state = player.states.recv_async() => {
                let Ok(state) = state else { break };
                for event in &state.messages {
                    println!("{}", serde_json::to_string(event)?);
                    delivered += 1;
                }
                if let Some(error) = &state.fatal_error {
                    log::error!("Playback stopped: {error}");
                    break;
                }
                match state.status {
                    PlayerStatus::Playing => started = true,
                    PlayerStatus::Idle if started && state.current_time >= state.end_time => {
                        log::info!("Reached end of recording");
                        break;
                    }
                    PlayerStatus::Closed => break,
                    _ => {}
                }
            }
        }
    }

    log::info!("Delivered {} messages", delivered);
    // The player may already have stopped on a fatal error.
    let _ = player.handle.close();
    player.task.await?;
    Ok(())
}

fn parse_seek(raw: &str) -> Option<SeekToTimeSpec> {
    if let Some(percent) = raw.strip_suffix('%') {
        let percent: f64 = percent.trim().parse().ok()?;
        return (0.0..=100.0)
            .contains(&percent)
            .then(|| SeekToTimeSpec::Fraction(percent / 100.0));
    }
    if let Some(offset) = raw.strip_prefix('+') {
        return Some(SeekToTimeSpec::Relative {
            offset: parse_time_str(offset)?,
            from_end: false,
        });
    }
    if let Some(offset) = raw.strip_prefix('-') {
        return Some(SeekToTimeSpec::Relative {
            offset: parse_time_str(offset)?,
            from_end: true,
        });
    }
    parse_time_str(raw).map(SeekToTimeSpec::Absolute)
}

fn subscriptions_for(state: &PlayerState, topics: &[String], raw: bool) -> Vec<Subscription> {
    let names: Vec<&str> = if topics.is_empty() {
        state.topics.iter().map(|t| t.name.as_str()).collect()
    } else {
        for topic in topics {
            if !state.topics.iter().any(|t| &t.name == topic) {
                log::warn!("Topic {} is not in the recording", topic);
            }
        }
        topics.iter().map(String::as_str).collect()
    };
    names
        .into_iter()
        .map(|name| {
            if raw {
                Subscription::raw(name)
            } else {
                Subscription::parsed(name)
            }
        })
        .collect()
}
