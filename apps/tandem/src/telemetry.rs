use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "TANDEM_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Log to this file instead of stderr. Keeps the terminal free for chat.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(default_filter_for(config.level.to_filter())),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

/// webrtc-rs is chatty at debug and below; it stays at info unless the
/// filter env var says otherwise.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "hyper",
];

fn default_filter_for(level: LevelFilter) -> String {
    let mut filter = match level {
        LevelFilter::TRACE => "info,tandem=trace,tandem_proto=trace".to_string(),
        LevelFilter::DEBUG => "info,tandem=debug,tandem_proto=debug".to_string(),
        other => return other.to_string().to_lowercase(),
    };
    for target in NOISY_TARGETS {
        filter.push(',');
        filter.push_str(target);
        filter.push_str("=info");
    }
    filter
}
