#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_SESSION_TOKEN_TTL_SECS: u64 = 12 * 60 * 60;
pub const DEFAULT_GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
pub const DEFAULT_ROOM_CREATE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_EMPTY_ROOM_GRACE_SECS: u64 = 60;
pub const DEFAULT_CHAT_HISTORY_LIMIT: usize = 500;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_CONSUMERS_PER_PEER: usize = 64;
pub const DEFAULT_RTC_MIN_PORT: u16 = 40_000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49_999;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration. The JWT secret is redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub session_token_ttl: Duration,
    pub google_client_id: Option<String>,
    pub google_tokeninfo_url: String,
    pub client_origin: Option<String>,
    pub static_dir: Option<String>,
    pub listen_ip: IpAddr,
    pub announced_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub num_workers: usize,
    pub room_create_timeout: Duration,
    pub empty_room_grace: Duration,
    pub chat_history_limit: usize,
    pub max_connections: usize,
    pub max_consumers_per_peer: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("jwt_secret", &"[REDACTED]")
            .field("session_token_ttl", &self.session_token_ttl)
            .field("google_client_id", &self.google_client_id)
            .field("google_tokeninfo_url", &self.google_tokeninfo_url)
            .field("client_origin", &self.client_origin)
            .field("static_dir", &self.static_dir)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("num_workers", &self.num_workers)
            .field("room_create_timeout", &self.room_create_timeout)
            .field("empty_room_grace", &self.empty_room_grace)
            .field("chat_history_limit", &self.chat_history_limit)
            .field("max_connections", &self.max_connections)
            .field("max_consumers_per_peer", &self.max_consumers_per_peer)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Load configuration from a map (used by tests).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar("JWT_SECRET".to_string()))?;

        let num_workers = parse_or(vars, "MEDIASOUP_NUM_WORKERS", num_cpus::get())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue("MEDIASOUP_NUM_WORKERS must be at least 1".to_string()));
        }

        let max_connections = parse_or(vars, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(ConfigError::InvalidValue("MAX_CONNECTIONS=0 would reject all connections".to_string()));
        }

        let rtc_min_port = parse_or(vars, "MEDIASOUP_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or(vars, "MEDIASOUP_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "MEDIASOUP_MIN_PORT ({rtc_min_port}) exceeds MEDIASOUP_MAX_PORT ({rtc_max_port})"
            )));
        }

        Ok(Self {
            port: parse_or(vars, "PORT", DEFAULT_PORT)?,
            jwt_secret,
            session_token_ttl: Duration::from_secs(parse_or(
                vars,
                "SESSION_TOKEN_TTL_SECS",
                DEFAULT_SESSION_TOKEN_TTL_SECS,
            )?),
            google_client_id: non_empty(vars, "GOOGLE_CLIENT_ID"),
            google_tokeninfo_url: non_empty(vars, "GOOGLE_TOKENINFO_URL")
                .unwrap_or_else(|| DEFAULT_GOOGLE_TOKENINFO_URL.to_string()),
            client_origin: non_empty(vars, "CLIENT_ORIGIN"),
            static_dir: non_empty(vars, "STATIC_DIR"),
            listen_ip: parse_or(vars, "MEDIASOUP_LISTEN_IP", IpAddr::from([0, 0, 0, 0]))?,
            announced_ip: parse_or(vars, "MEDIASOUP_ANNOUNCED_IP", IpAddr::from([127, 0, 0, 1]))?,
            rtc_min_port,
            rtc_max_port,
            num_workers,
            room_create_timeout: Duration::from_millis(parse_or(
                vars,
                "ROOM_CREATE_TIMEOUT_MS",
                DEFAULT_ROOM_CREATE_TIMEOUT_MS,
            )?),
            empty_room_grace: Duration::from_secs(parse_or(
                vars,
                "EMPTY_ROOM_GRACE_SECS",
                DEFAULT_EMPTY_ROOM_GRACE_SECS,
            )?),
            chat_history_limit: parse_or(vars, "CHAT_HISTORY_LIMIT", DEFAULT_CHAT_HISTORY_LIMIT)?,
            max_connections,
            max_consumers_per_peer: parse_or(vars, "MAX_CONSUMERS_PER_PEER", DEFAULT_MAX_CONSUMERS_PER_PEER)?,
        })
    }
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError> {
    match non_empty(vars, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([("JWT_SECRET".to_string(), "test-secret".to_string())])
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.chat_history_limit, DEFAULT_CHAT_HISTORY_LIMIT);
        assert_eq!(config.room_create_timeout, Duration::from_millis(DEFAULT_ROOM_CREATE_TIMEOUT_MS));
        assert_eq!(config.announced_ip, IpAddr::from([127, 0, 0, 1]));
        assert!(config.google_client_id.is_none());
        assert!(config.num_workers >= 1);
    }

    #[test]
    fn test_missing_secret_rejected() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "JWT_SECRET"));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let mut vars = base_vars();
        vars.insert("PORT".to_string(), "not-a-port".to_string());
        assert!(matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_connections_rejected() {
        let mut vars = base_vars();
        vars.insert("MAX_CONNECTIONS".to_string(), "0".to_string());
        assert!(matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_port_range_order_checked() {
        let mut vars = base_vars();
        vars.insert("MEDIASOUP_MIN_PORT".to_string(), "50000".to_string());
        vars.insert("MEDIASOUP_MAX_PORT".to_string(), "40000".to_string());
        assert!(matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_overrides_parsed() {
        let mut vars = base_vars();
        vars.insert("PORT".to_string(), "8080".to_string());
        vars.insert("GOOGLE_CLIENT_ID".to_string(), "client-123".to_string());
        vars.insert("MEDIASOUP_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string());
        vars.insert("CHAT_HISTORY_LIMIT".to_string(), "10".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.google_client_id.as_deref(), Some("client-123"));
        assert_eq!(config.announced_ip, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(config.chat_history_limit, 10);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("test-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
