use std::env;
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Members silent for longer than this are evicted.
    pub heartbeat_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("TANDEM_RELAY_HOST")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = lookup("TANDEM_RELAY_PORT")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let heartbeat_timeout = lookup("TANDEM_HEARTBEAT_TIMEOUT_SECS")
            .and_then(|value| value.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS));

        Self {
            host,
            port,
            heartbeat_timeout,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_timeout::timeout]
    fn defaults_when_unset() {
        let config = RelayConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:3001");
    }

    #[test_timeout::timeout]
    fn reads_overrides() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("TANDEM_RELAY_HOST", "127.0.0.1"),
            ("TANDEM_RELAY_PORT", "4100"),
            ("TANDEM_HEARTBEAT_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(config.bind_addr(), "127.0.0.1:4100");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test_timeout::timeout]
    fn ignores_garbage_values() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("TANDEM_RELAY_PORT", "not-a-port"),
            ("TANDEM_HEARTBEAT_TIMEOUT_SECS", "0"),
        ]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(
            config.heartbeat_timeout,
            Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS)
        );
    }
}
