//! Client configuration loaded from environment variables.
//!
//! Everything except the user id has a default suitable for local
//! development against a backend on `localhost`.

use std::path::PathBuf;
use std::time::Duration;

use nexfi_shared::constants::{
    DEFAULT_API_TIMEOUT_SECS, DEFAULT_API_URL, DEFAULT_ICE_SERVERS, SYNC_INITIAL_DELAY_MS,
    SYNC_INTERVAL_SECS, SYNC_RECONNECT_DEBOUNCE_MS,
};
use nexfi_shared::UserId;
use nexfi_sync::SyncSchedule;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Id of the signed-in user.
    /// Env: `NEXFI_USER_ID`
    /// Default: none; [`NexfiContext::start`](crate::NexfiContext::start)
    /// refuses to run without it.
    pub user_id: Option<UserId>,

    /// Backend base URL.
    /// Env: `NEXFI_API_URL`
    /// Default: `http://localhost:5000`
    pub api_url: String,

    /// Bearer token sent with sync requests.
    /// Env: `NEXFI_API_TOKEN`
    /// Default: none.
    pub api_token: Option<String>,

    /// Env: `NEXFI_API_TIMEOUT_SECS`
    /// Default: `30`
    pub api_timeout: Duration,

    /// Database file.
    /// Env: `NEXFI_DB_PATH`
    /// Default: the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Whether direct peer sessions are attempted at all.
    /// Env: `NEXFI_LAN_ENABLED` (true/false)
    /// Default: `true`
    pub lan_enabled: bool,

    /// Env: `NEXFI_ICE_SERVERS` (comma-separated URLs)
    /// Default: the public Google STUN pair.
    pub ice_servers: Vec<String>,

    /// Env: `NEXFI_SYNC_INTERVAL_SECS`
    /// Default: `30`
    pub sync_interval: Duration,

    /// Env: `NEXFI_SYNC_INITIAL_DELAY_MS`
    /// Default: `3000`
    pub sync_initial_delay: Duration,

    /// Env: `NEXFI_SYNC_RECONNECT_DEBOUNCE_MS`
    /// Default: `1500`
    pub sync_reconnect_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            api_timeout: Duration::from_secs(DEFAULT_API_TIMEOUT_SECS),
            db_path: None,
            lan_enabled: true,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            sync_interval: Duration::from_secs(SYNC_INTERVAL_SECS),
            sync_initial_delay: Duration::from_millis(SYNC_INITIAL_DELAY_MS),
            sync_reconnect_debounce: Duration::from_millis(SYNC_RECONNECT_DEBOUNCE_MS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(id) = lookup("NEXFI_USER_ID") {
            let id = id.trim();
            if id.is_empty() {
                tracing::warn!("Empty NEXFI_USER_ID, ignoring");
            } else {
                config.user_id = Some(UserId::new(id));
            }
        }

        if let Some(url) = lookup("NEXFI_API_URL") {
            if url.starts_with("http://") || url.starts_with("https://") {
                config.api_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid NEXFI_API_URL, using default");
            }
        }

        if let Some(token) = lookup("NEXFI_API_TOKEN") {
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }

        if let Some(val) = lookup("NEXFI_API_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.api_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid NEXFI_API_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(path) = lookup("NEXFI_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("NEXFI_LAN_ENABLED") {
            config.lan_enabled = val != "false" && val != "0";
        }

        if let Some(val) = lookup("NEXFI_ICE_SERVERS") {
            let servers = parse_list(&val);
            if servers.is_empty() {
                tracing::warn!(value = %val, "Invalid NEXFI_ICE_SERVERS, using default");
            } else {
                config.ice_servers = servers;
            }
        }

        if let Some(val) = lookup("NEXFI_SYNC_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.sync_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid NEXFI_SYNC_INTERVAL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("NEXFI_SYNC_INITIAL_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.sync_initial_delay = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid NEXFI_SYNC_INITIAL_DELAY_MS, using default")
                }
            }
        }

        if let Some(val) = lookup("NEXFI_SYNC_RECONNECT_DEBOUNCE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.sync_reconnect_debounce = Duration::from_millis(ms),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid NEXFI_SYNC_RECONNECT_DEBOUNCE_MS, using default"
                ),
            }
        }

        config
    }

    pub fn sync_schedule(&self) -> SyncSchedule {
        SyncSchedule {
            interval: self.sync_interval,
            initial_delay: self.sync_initial_delay,
            reconnect_debounce: self.sync_reconnect_debounce,
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.user_id, None);
        assert_eq!(config.api_url, "http://localhost:5000");
        assert_eq!(config.api_timeout, Duration::from_secs(30));
        assert!(config.lan_enabled);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.sync_schedule(), SyncSchedule::default());
    }

    #[test]
    fn test_reads_every_variable() {
        let config = load(&[
            ("NEXFI_USER_ID", "42"),
            ("NEXFI_API_URL", "https://api.nexfi.example"),
            ("NEXFI_API_TOKEN", "secret"),
            ("NEXFI_API_TIMEOUT_SECS", "5"),
            ("NEXFI_DB_PATH", "/tmp/nexfi-test.db"),
            ("NEXFI_LAN_ENABLED", "0"),
            ("NEXFI_ICE_SERVERS", "stun:a:1, ,stun:b:2"),
            ("NEXFI_SYNC_INTERVAL_SECS", "60"),
            ("NEXFI_SYNC_INITIAL_DELAY_MS", "0"),
            ("NEXFI_SYNC_RECONNECT_DEBOUNCE_MS", "250"),
        ]);

        assert_eq!(config.user_id, Some(UserId::from("42")));
        assert_eq!(config.api_url, "https://api.nexfi.example");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.api_timeout, Duration::from_secs(5));
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/nexfi-test.db")));
        assert!(!config.lan_enabled);
        assert_eq!(config.ice_servers, ["stun:a:1", "stun:b:2"]);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.sync_initial_delay, Duration::ZERO);
        assert_eq!(config.sync_reconnect_debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = load(&[
            ("NEXFI_USER_ID", "  "),
            ("NEXFI_API_URL", "localhost:5000"),
            ("NEXFI_API_TOKEN", ""),
            ("NEXFI_API_TIMEOUT_SECS", "0"),
            ("NEXFI_ICE_SERVERS", " , "),
            ("NEXFI_SYNC_INTERVAL_SECS", "soon"),
            ("NEXFI_SYNC_INITIAL_DELAY_MS", "-1"),
        ]);
        let defaults = ClientConfig::default();

        assert_eq!(config.user_id, None);
        assert_eq!(config.api_url, defaults.api_url);
        assert_eq!(config.api_token, None);
        assert_eq!(config.api_timeout, defaults.api_timeout);
        assert_eq!(config.ice_servers, defaults.ice_servers);
        assert_eq!(config.sync_schedule(), defaults.sync_schedule());
    }

    #[test]
    fn test_lan_flag_parsing() {
        assert!(load(&[("NEXFI_LAN_ENABLED", "true")]).lan_enabled);
        assert!(load(&[("NEXFI_LAN_ENABLED", "yes")]).lan_enabled);
        assert!(!load(&[("NEXFI_LAN_ENABLED", "false")]).lan_enabled);
    }
}
