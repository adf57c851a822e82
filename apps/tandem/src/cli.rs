use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tandem_proto::room::resolve_fragment;
use tandem_proto::{Features, RoomId, RoomKind, RoomResolution};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::assist::{CompletionClient, TranscriptionClient};
use crate::config::ClientConfig;
use crate::delivery::{Author, ChatEntry, DeliveryState, Stamper, SystemClock};
use crate::room::{AssistClients, RoomCommand, RoomController, RoomEvent, RoomOptions};
use crate::session::SessionUpdate;
use crate::signaling::{self, DEFAULT_PING_INTERVAL};
use crate::telemetry::LogLevel;
use crate::transport::webrtc::WebRtcFactory;

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Peer-to-peer audio, video and chat rooms")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room, creating it when no token is given
    Join(JoinArgs),
}

#[derive(Args, Debug, Default)]
pub struct JoinArgs {
    /// Room token, or a URL whose fragment holds one
    pub room: Option<String>,

    /// Create a multi-party room instead of a two-party one
    #[arg(long)]
    pub mesh: bool,

    /// Relay base URL (overrides TANDEM_RELAY_URL)
    #[arg(long)]
    pub relay: Option<String>,

    /// Directory for received files (overrides TANDEM_DOWNLOAD_DIR)
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Abandon incomplete file transfers after this many seconds
    #[arg(long)]
    pub transfer_timeout_secs: Option<u64>,

    /// Do not capture a microphone track
    #[arg(long)]
    pub no_audio: bool,

    /// Do not capture a camera track
    #[arg(long)]
    pub no_video: bool,
}

impl JoinArgs {
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        if let Some(secs) = self.transfer_timeout_secs.filter(|secs| *secs > 0) {
            config.transfer_policy.timeout = Some(Duration::from_secs(secs));
        }
        config
    }
}

/// Accepts a bare token or a URL carrying the token in its fragment. A URL
/// whose fragment is unusable gets a freshly generated room.
pub fn resolve_room(arg: Option<&str>, mesh: bool) -> Result<RoomResolution> {
    let wanted = if mesh { RoomKind::Mesh } else { RoomKind::Pair };
    let mut rng = rand::thread_rng();
    let Some(arg) = arg.map(str::trim).filter(|arg| !arg.is_empty()) else {
        return Ok(RoomResolution {
            room: RoomId::generate(wanted, &mut rng),
            generated: true,
        });
    };
    if let Ok(room) = RoomId::parse(arg) {
        return Ok(RoomResolution {
            room,
            generated: false,
        });
    }
    let Ok(url) = Url::parse(arg) else {
        bail!("{arg:?} is neither a room token nor a URL");
    };
    let fragment = url.fragment().unwrap_or_default();
    let kind = RoomId::parse(fragment)
        .map(|room| room.kind())
        .unwrap_or(wanted);
    Ok(resolve_fragment(fragment, kind, &mut rng))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
    #[error("unknown command {0}; try /file /mic /cam /filter /ask /transcribe /leave")]
    Unknown(String),
}

/// Plain lines are chat text; a leading `//` sends a literal slash.
pub fn parse_line(line: &str) -> Result<Option<RoomCommand>, LineError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    if let Some(literal) = line.strip_prefix("//") {
        return Ok(Some(RoomCommand::SendText(format!("/{literal}"))));
    }
    if !line.starts_with('/') {
        return Ok(Some(RoomCommand::SendText(line.to_string())));
    }
    let (name, rest) = match line.trim().split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line.trim(), ""),
    };
    let required = |command: &'static str| {
        if rest.is_empty() {
            Err(LineError::MissingArgument(command))
        } else {
            Ok(rest.to_string())
        }
    };
    let command = match name {
        "/file" => RoomCommand::SendFile(PathBuf::from(required("/file")?)),
        "/mic" => RoomCommand::ToggleMic,
        "/cam" => RoomCommand::ToggleCam,
        "/filter" => RoomCommand::CycleFilter,
        "/ask" => RoomCommand::Ask(required("/ask")?),
        "/transcribe" => RoomCommand::Transcribe(PathBuf::from(required("/transcribe")?)),
        "/leave" | "/quit" => RoomCommand::Leave,
        other => return Err(LineError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn author_label(author: &Author) -> String {
    match author {
        Author::Local => "you".to_string(),
        Author::Remote(Some(id)) => id.chars().take(8).collect(),
        Author::Remote(None) => "peer".to_string(),
        Author::Assistant => "assistant".to_string(),
    }
}

fn describe_entry(entry: &ChatEntry) -> String {
    let who = author_label(&entry.author);
    if let Some(text) = &entry.text {
        return format!("{who}: {text}");
    }
    match (&entry.file, &entry.saved_to, &entry.author) {
        (Some(file), _, Author::Local) => {
            format!("{who}: sending {} ({} bytes)", file.name, file.size)
        }
        (Some(file), Some(path), _) => {
            format!("{who}: sent {} ({} bytes), saved to {}", file.name, file.size, path.display())
        }
        (Some(file), None, _) => format!("{who}: sent {} ({} bytes)", file.name, file.size),
        (None, _, _) => format!("{who}: (empty)"),
    }
}

/// Terminal rendering of a room event. Echoes of typed chat are skipped.
pub fn format_event(event: &RoomEvent) -> Option<String> {
    let on_off = |on: bool| if on { "on" } else { "off" };
    let line = match event {
        RoomEvent::Joined { self_id, peers } => {
            format!("* joined as {self_id}; {} other member(s) present", peers.len())
        }
        RoomEvent::MemberJoined(id) => format!("* {id} joined"),
        RoomEvent::MemberLeft(id) => format!("* {id} left"),
        RoomEvent::Sent(entry) if entry.file.is_none() => return None,
        RoomEvent::Sent(entry) | RoomEvent::Received(entry) | RoomEvent::Assistant(entry) => {
            describe_entry(entry)
        }
        RoomEvent::Delivered { timestamp, state } => match state {
            DeliveryState::Delayed => format!("  delivered late ({timestamp})"),
            _ => format!("  delivered ({timestamp})"),
        },
        RoomEvent::MicToggled(on) => format!("* microphone {}", on_off(*on)),
        RoomEvent::CamToggled(on) => format!("* camera {}", on_off(*on)),
        RoomEvent::FilterApplied(filter) => format!("* video filter: {filter}"),
        RoomEvent::Peer(event) => match &event.update {
            SessionUpdate::ConnectionState(state) => format!("* connection {state:?}"),
            SessionUpdate::RemoteMic(on) => format!("* peer microphone {}", on_off(*on)),
            SessionUpdate::RemoteVideo { enabled, .. } => {
                format!("* peer camera {}", on_off(*enabled))
            }
            SessionUpdate::RemoteFilter(name) => format!("* peer video filter: {name}"),
            SessionUpdate::RemoteTrack(track) => {
                format!("* receiving {} from peer", track.kind.as_str())
            }
            SessionUpdate::TransferAbandoned { label, reason } => {
                format!("* transfer {label} abandoned: {reason}")
            }
            SessionUpdate::Reset => "* peer connection reset".to_string(),
            SessionUpdate::Warning(message) => format!("! {message}"),
            _ => return None,
        },
        RoomEvent::Error(message) => format!("! {message}"),
        RoomEvent::Closed => "* left room".to_string(),
    };
    Some(line)
}

async fn read_commands(commands: mpsc::UnboundedSender<RoomCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some(command)) => {
                    let leaving = command == RoomCommand::Leave;
                    if commands.send(command).is_err() || leaving {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}"),
            },
            Ok(None) => {
                let _ = commands.send(RoomCommand::Leave);
                break;
            }
            Err(err) => {
                warn!(target: "tandem::cli", "stdin closed: {err}");
                let _ = commands.send(RoomCommand::Leave);
                break;
            }
        }
    }
}

pub async fn run_join(args: JoinArgs) -> Result<()> {
    let config = args.apply(ClientConfig::from_env());
    let resolution = resolve_room(args.room.as_deref(), args.mesh)?;
    let room = resolution.room;
    if resolution.generated {
        println!("created room {room}; share it with: tandem join {room}");
    }

    let relay = signaling::connect(&config.relay_url, &room, DEFAULT_PING_INTERVAL)
        .await
        .with_context(|| format!("connecting to relay at {}", config.relay_url))?;

    let options = RoomOptions {
        features: Features::default(),
        capture_audio: !args.no_audio,
        capture_video: !args.no_video,
        transfer_policy: config.transfer_policy,
        download_dir: Some(config.download_dir.clone()),
        ..RoomOptions::default()
    };
    let assist = AssistClients {
        completion: config.completion_url.clone().map(CompletionClient::new),
        transcription: config.transcription_url.clone().map(TranscriptionClient::new),
    };
    let (handle, mut events) = RoomController::start(
        room,
        relay,
        Arc::new(WebRtcFactory::new(config.ice_servers.clone())),
        Arc::new(Stamper::new(Arc::new(SystemClock))),
        options,
        assist,
    );

    let input = tokio::spawn(read_commands(handle.commands()));
    while let Some(event) = events.recv().await {
        if let Some(line) = format_event(&event) {
            match event {
                RoomEvent::Error(_) => eprintln!("{line}"),
                _ => println!("{line}"),
            }
        }
        if event == RoomEvent::Closed {
            break;
        }
    }
    input.abort();
    handle.leave().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn lines_map_to_commands() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(
            parse_line("hello there"),
            Ok(Some(RoomCommand::SendText("hello there".into())))
        );
        assert_eq!(
            parse_line("//shrug"),
            Ok(Some(RoomCommand::SendText("/shrug".into())))
        );
        assert_eq!(
            parse_line("/file  ./cat.png "),
            Ok(Some(RoomCommand::SendFile(PathBuf::from("./cat.png"))))
        );
        assert_eq!(parse_line("/mic"), Ok(Some(RoomCommand::ToggleMic)));
        assert_eq!(
            parse_line("/ask what is glare?"),
            Ok(Some(RoomCommand::Ask("what is glare?".into())))
        );
        assert_eq!(parse_line("/quit"), Ok(Some(RoomCommand::Leave)));
        assert_eq!(parse_line("/ask"), Err(LineError::MissingArgument("/ask")));
        assert_eq!(
            parse_line("/dance"),
            Err(LineError::Unknown("/dance".into()))
        );
    }

    #[test_timeout::timeout]
    fn room_argument_forms() {
        let direct = resolve_room(Some("7654321"), false).unwrap();
        assert_eq!(direct.room.as_str(), "7654321");
        assert!(!direct.generated);

        let linked = resolve_room(Some("https://tandem.example/mesh#abcd-efgh-ijkl"), false).unwrap();
        assert_eq!(linked.room.as_str(), "abcd-efgh-ijkl");
        assert_eq!(linked.room.kind(), RoomKind::Mesh);

        let fresh = resolve_room(Some("https://tandem.example/#nope"), true).unwrap();
        assert!(fresh.generated);
        assert_eq!(fresh.room.kind(), RoomKind::Mesh);

        let none = resolve_room(None, false).unwrap();
        assert!(none.generated);
        assert_eq!(none.room.kind(), RoomKind::Pair);

        assert!(resolve_room(Some("not a room"), false).is_err());
    }

    #[test_timeout::timeout]
    fn flags_override_environment() {
        let args = JoinArgs {
            relay: Some("ws://10.0.0.2:3001".into()),
            transfer_timeout_secs: Some(5),
            ..JoinArgs::default()
        };
        let config = args.apply(ClientConfig::default());
        assert_eq!(config.relay_url, "ws://10.0.0.2:3001");
        assert_eq!(config.transfer_policy.timeout, Some(Duration::from_secs(5)));
    }

    #[test_timeout::timeout]
    fn typed_chat_is_not_echoed() {
        let entry = ChatEntry {
            author: Author::Local,
            timestamp: 1,
            text: Some("hi".into()),
            file: None,
            saved_to: None,
            delivery: DeliveryState::Pending,
        };
        assert_eq!(format_event(&RoomEvent::Sent(entry.clone())), None);
        let received = ChatEntry {
            author: Author::Remote(None),
            ..entry
        };
        assert_eq!(
            format_event(&RoomEvent::Received(received)).as_deref(),
            Some("peer: hi")
        );
    }
}
