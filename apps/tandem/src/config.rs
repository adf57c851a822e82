use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::delivery::TransferPolicy;
use crate::transport::IceServer;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3001";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Client configuration, read from the environment. CLI flags override
/// individual fields afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub relay_url: String,
    pub ice_servers: Vec<IceServer>,
    pub transfer_policy: TransferPolicy,
    /// Where received files are written. Defaults to the working directory.
    pub download_dir: PathBuf,
    pub completion_url: Option<Url>,
    pub transcription_url: Option<Url>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let relay_url = present("TANDEM_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let localhost_only = present("TANDEM_LOCALHOST_ONLY").is_some_and(|v| v != "0");
        let ice_servers = if localhost_only {
            Vec::new()
        } else {
            match present("TANDEM_ICE_SERVERS") {
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect(),
                None => vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            }
        };

        let transfer_policy = TransferPolicy {
            timeout: present("TANDEM_TRANSFER_TIMEOUT_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        let download_dir = present("TANDEM_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            relay_url,
            ice_servers,
            transfer_policy,
            download_dir,
            completion_url: present("TANDEM_COMPLETION_URL").and_then(|v| Url::parse(&v).ok()),
            transcription_url: present("TANDEM_TRANSCRIPTION_URL")
                .and_then(|v| Url::parse(&v).ok()),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_timeout::timeout]
    fn defaults_when_unset() {
        let config = ClientConfig::default();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_SERVER)]);
        assert_eq!(config.transfer_policy.timeout, None);
        assert_eq!(config.download_dir, PathBuf::from("."));
        assert!(config.completion_url.is_none());
    }

    #[test_timeout::timeout]
    fn localhost_only_drops_ice_servers() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("TANDEM_LOCALHOST_ONLY", "1"),
            ("TANDEM_ICE_SERVERS", "stun:example.org:3478"),
        ]));
        assert!(config.ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn reads_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("TANDEM_RELAY_URL", "wss://relay.example"),
            ("TANDEM_ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478"),
            ("TANDEM_TRANSFER_TIMEOUT_SECS", "45"),
            ("TANDEM_DOWNLOAD_DIR", "/tmp/inbox"),
            ("TANDEM_COMPLETION_URL", "http://localhost:3000/api/chat"),
            ("TANDEM_TRANSCRIPTION_URL", "not a url"),
        ]));
        assert_eq!(config.relay_url, "wss://relay.example");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["stun:b.example:3478"]);
        assert_eq!(config.transfer_policy.timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.download_dir, PathBuf::from("/tmp/inbox"));
        assert_eq!(
            config.completion_url.as_ref().map(Url::as_str),
            Some("http://localhost:3000/api/chat")
        );
        assert!(config.transcription_url.is_none());
    }

    #[test_timeout::timeout]
    fn from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var("TANDEM_RELAY_URL").ok();
        unsafe {
            env::set_var("TANDEM_RELAY_URL", "ws://relay.test:9000");
        }
        let config = ClientConfig::from_env();
        assert_eq!(config.relay_url, "ws://relay.test:9000");
        unsafe {
            match original {
                Some(value) => env::set_var("TANDEM_RELAY_URL", value),
                None => env::remove_var("TANDEM_RELAY_URL"),
            }
        }
    }
}
