use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::session::RegistryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: String,
    pub user_id: String,
    pub username: String,
    pub user_email: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_sessions: usize,
    pub retention_window: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_API_TOKEN is required and must not be empty")]
    MissingApiToken,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_HEARTBEAT_INTERVAL_SECS must be shorter than MCP_IDLE_TIMEOUT_SECS")]
    HeartbeatNotBelowIdleTimeout,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_token = non_empty("MCP_API_TOKEN").ok_or(ConfigError::MissingApiToken)?;
        let user_id = non_empty("MCP_USER_ID").unwrap_or_else(|| "mcp-user".to_string());
        let username = non_empty("MCP_USERNAME").unwrap_or_else(|| "mcp".to_string());
        let user_email = non_empty("MCP_USER_EMAIL");

        let bind_addr = non_empty("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = non_empty("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let positive = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match non_empty(key) {
                None => Ok(default),
                Some(value) => value
                    .parse::<u64>()
                    .ok()
                    .filter(|parsed| *parsed > 0)
                    .ok_or(ConfigError::InvalidNumber(key)),
            }
        };

        let max_sessions = usize::try_from(positive("MCP_MAX_SESSIONS", 1024)?)
            .map_err(|_| ConfigError::InvalidNumber("MCP_MAX_SESSIONS"))?;
        let retention_window = usize::try_from(positive("MCP_RETENTION_WINDOW", 256)?)
            .map_err(|_| ConfigError::InvalidNumber("MCP_RETENTION_WINDOW"))?;
        let idle_timeout = Duration::from_secs(positive("MCP_IDLE_TIMEOUT_SECS", 300)?);
        let sweep_interval = Duration::from_secs(positive("MCP_SWEEP_INTERVAL_SECS", 30)?);
        let heartbeat_interval = Duration::from_secs(positive("MCP_HEARTBEAT_INTERVAL_SECS", 15)?);
        // A quiet stream is kept alive only by its heartbeats.
        if heartbeat_interval >= idle_timeout {
            return Err(ConfigError::HeartbeatNotBelowIdleTimeout);
        }

        let config = Self {
            api_token,
            user_id,
            username,
            user_email,
            bind_addr,
            bind_port,
            max_sessions,
            retention_window,
            idle_timeout,
            sweep_interval,
            heartbeat_interval,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.max_sessions,
            retention: self.retention_window,
            idle_timeout: self.idle_timeout,
        }
    }
}
