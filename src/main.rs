use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use smartmic::api::{SongId, UplAction};
use smartmic::config::ConfigStore;
use smartmic::control::Keystroke;
use smartmic::events::{ClientEvent, Severity};
use smartmic::join::JoinOutcome;
use smartmic::rooms::{mic_room, parse_capacity, pretty_room_name};
use smartmic::MicClient;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// SmartMic command line arguments
#[derive(Parser, Debug)]
#[command(name = "smartmic")]
#[command(version, about = "Headless SmartMic microphone client", long_about = None)]
struct CliArgs {
    /// Server base URL (overrides database config)
    #[arg(short = 's', long, value_name = "URL")]
    server: Option<String>,

    /// Display name (overrides the remembered one)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Data directory path (default: $HOME/.config/smartmic)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected: publish the microphone and keep the room in sync
    Run {
        /// Room to join first (lobby, mic1..mic6 or a mic number)
        room: Option<String>,
        /// Only use rooms and the remote keyboard, no microphone
        #[arg(long)]
        control_only: bool,
    },
    /// Join a room
    Join { room: String },
    /// Leave every room
    Leave,
    /// Remove someone from their room
    Kick { name: String },
    /// Set the singer limit of every mic room
    Capacity { limit: String },
    /// Show rooms and the control lock
    Status,
    /// Remote keyboard lock and typing
    Control {
        #[command(subcommand)]
        action: ControlAction,
    },
    /// Set the per-player delay in milliseconds
    Delay {
        #[arg(allow_hyphen_values = true)]
        delay_ms: i64,
    },
    /// Set the display name
    Name { name: String },
    /// Search songs and edit the user playlist
    Songs {
        #[command(subcommand)]
        action: SongAction,
    },
    /// Playlist mode
    Playlist {
        #[command(subcommand)]
        action: PlaylistAction,
    },
}

#[derive(Subcommand, Debug)]
enum SongAction {
    /// Search the catalogue
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Add a song to the user playlist
    Add { id: SongId },
    /// Remove a song from the user playlist
    Remove { id: SongId },
}

#[derive(Subcommand, Debug)]
enum PlaylistAction {
    Status,
    /// Switch playlist mode on or off
    Toggle {
        /// Seconds between songs
        #[arg(long, value_name = "SECS")]
        countdown: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum ControlAction {
    Acquire,
    Release,
    /// Type text on the shared keyboard
    Type { text: String },
    /// Send a single key (a character, Enter, Backspace, ArrowUp...)
    Key { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::debug!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let store = ConfigStore::new(&data_dir.join("smartmic.db")).await?;

    // Apply CLI argument overrides to config (only if explicitly specified)
    let mut config = (*store.get()).clone();
    if let Some(server) = &args.server {
        config.server.base_url = server.trim_end_matches('/').to_string();
    }
    if let Command::Run {
        control_only: true, ..
    } = args.command
    {
        config.media.control_only = true;
    }

    let client = MicClient::with_config(store, Arc::new(config)).await?;
    if let Some(name) = &args.name {
        client.set_name(name).await?;
    }

    match args.command {
        Command::Run { room, .. } => run(client, room).await?,
        Command::Join { room } => {
            let mut events = client.subscribe();
            let result = client.join(&resolve_room(&room)).await;
            print_messages(&mut events);
            match result {
                Ok(JoinOutcome::Joined { room, .. }) => println!("In {}", pretty_room_name(&room)),
                Ok(JoinOutcome::Superseded) => {}
                Err(e) => anyhow::bail!("{} ({})", e, e.code()),
            }
        }
        Command::Leave => {
            client.leave().await?;
            println!("Left all rooms");
        }
        Command::Kick { name } => {
            client.kick(&name).await?;
            println!("{} was kicked", name);
        }
        Command::Capacity { limit } => {
            client.refresh_control().await.ok();
            let mut events = client.subscribe();
            let result = client.set_capacity(parse_capacity(&limit)).await;
            print_messages(&mut events);
            result?;
        }
        Command::Status => {
            client.refresh_rooms().await?;
            let lock = client.refresh_control().await?;
            let session = client.snapshot();
            for (room, members) in session.rooms().iter() {
                let limit = session.capacity().limit(room);
                println!(
                    "{:<8} {}/{}  {}",
                    pretty_room_name(room),
                    members.len(),
                    limit,
                    members.join(", ")
                );
            }
            println!("{}", lock.describe());
        }
        Command::Control { action } => match action {
            ControlAction::Acquire => {
                client.acquire_control().await?;
                println!("{}", client.control_lock().describe());
            }
            ControlAction::Release => client.release_control().await?,
            ControlAction::Type { text } => {
                client.acquire_control().await?;
                client.type_text(&text).await?;
            }
            ControlAction::Key { key } => {
                let key: Keystroke = key.parse()?;
                client.acquire_control().await?;
                client.send_key(key).await?;
            }
        },
        Command::Delay { delay_ms } => {
            let stored = client.set_delay(delay_ms).await?;
            println!("Delay set to {}ms", stored);
        }
        Command::Name { name } => {
            let name = client.set_name(&name).await?;
            println!("Name set to {}", name);
        }
        Command::Songs { action } => match action {
            SongAction::Search { query } => {
                let items = client.search_songs(&query.join(" ")).await?;
                if items.is_empty() {
                    println!("No songs found");
                }
                for item in items {
                    let id = item.id.map(|id| id.to_string()).unwrap_or_default();
                    let mark = if item.upl { '*' } else { ' ' };
                    println!("{:>8} {} {}", id, mark, item.display);
                }
            }
            SongAction::Add { id } => set_upl(&client, &id, UplAction::Add).await?,
            SongAction::Remove { id } => set_upl(&client, &id, UplAction::Remove).await?,
        },
        Command::Playlist { action } => {
            let status = match action {
                PlaylistAction::Status => client.playlist_status().await?,
                PlaylistAction::Toggle { countdown } => client.toggle_playlist(countdown).await?,
            };
            print_playlist(&status);
        }
    }

    Ok(())
}

/// Long-running mode: log every event until Ctrl-C
async fn run(client: Arc<MicClient>, room: Option<String>) -> anyhow::Result<()> {
    tracing::info!("Starting SmartMic client v{}", env!("CARGO_PKG_VERSION"));

    let mut events = client.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event log lagged by {} events", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    client.start().await?;
    if let Some(room) = room {
        if let Err(e) = client.join(&resolve_room(&room)).await {
            tracing::warn!("Initial join failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    client.shutdown().await;
    logger.abort();
    tracing::info!("Client shutdown complete");
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::RoomMessage { severity, text } => match severity {
            Severity::Warn => tracing::warn!("{}", text),
            Severity::Ok | Severity::Info => tracing::info!("{}", text),
        },
        ClientEvent::RoomsUpdated { source, rooms } => {
            tracing::debug!("Rooms updated ({}): {:?}", source, rooms)
        }
        ClientEvent::CurrentRoomChanged { from, to } => tracing::info!(
            "Now in {} (was {})",
            pretty_room_name(to),
            pretty_room_name(from)
        ),
        ClientEvent::ControlChanged { owner_name, mine } => match (owner_name.as_deref(), *mine) {
            (_, true) => tracing::info!("You have control"),
            (Some(owner), false) => tracing::info!("Control: {}", owner),
            (None, false) => tracing::info!("Control: free"),
        },
        ClientEvent::MediaStateChanged { state } => tracing::info!("Microphone {}", state),
        ClientEvent::ReconnectScheduled {
            attempt,
            delay_secs,
        } => tracing::info!("Reconnecting in {}s (attempt {})", delay_secs, attempt),
        ClientEvent::Intervention { room, at } => tracing::warn!(
            "Audio intervention at {}: rejoined {}",
            at.format("%H:%M:%S"),
            pretty_room_name(room)
        ),
        ClientEvent::SystemError { module, message } => {
            tracing::error!("[{}] {}", module, message)
        }
    }
}

async fn set_upl(client: &MicClient, id: &SongId, action: UplAction) -> anyhow::Result<()> {
    let mut events = client.subscribe();
    let result = client.set_upl(id, action).await;
    print_messages(&mut events);
    result?;
    Ok(())
}

fn print_playlist(status: &smartmic::api::PlaylistStatus) {
    let on_off = if status.enabled { "enabled" } else { "disabled" };
    println!("Playlist mode {}: {}", on_off, status.headline());
    println!("Current: {}", status.current_song.as_deref().unwrap_or("-"));
    println!("Next:    {}", status.next_song.as_deref().unwrap_or("-"));
    if let Some(seconds) = status.countdown_seconds.filter(|s| *s > 0.0) {
        println!("Countdown: {} s ({})", seconds, status.countdown_text());
    }
    if let Some(added) = status.auto_added.filter(|n| *n > 0) {
        println!(
            "Auto-added {} random song{}",
            added,
            if added == 1 { "" } else { "s" }
        );
    }
    if status.lock_controls {
        println!("Controls are locked while the playlist runs");
    }
}

/// Print room messages published by a one-shot command
fn print_messages(events: &mut broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::RoomMessage { text, .. } = event {
            println!("{}", text);
        }
    }
}

/// Accept "3" as shorthand for "mic3"
fn resolve_room(raw: &str) -> String {
    let raw = raw.trim();
    raw.parse::<usize>()
        .ok()
        .and_then(mic_room)
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_lowercase())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "smartmic=error",
        LogLevel::Warn => "smartmic=warn",
        LogLevel::Info => "smartmic=info",
        LogLevel::Verbose => "smartmic=debug,webrtc=warn",
        LogLevel::Debug => "smartmic=debug,webrtc=info",
        LogLevel::Trace => "smartmic=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SMARTMIC_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("smartmic"),
        None => PathBuf::from(".smartmic"),
    }
}
