//! Environment-driven configuration
//!
//! All knobs come from the environment (optionally seeded from an env file):
//! `UPSTREAM_BASE_URL`, `UPSTREAM_API_KEY`, `UPSTREAM_API_PATH`,
//! `LISTEN_PORT`, `LOG_LEVEL`.

use std::env;

pub const DEFAULT_PORT: u16 = 18900;
pub const DEFAULT_API_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Minimal,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "minimal" => Some(LogLevel::Minimal),
            _ => None,
        }
    }

    /// The tracing env-filter directive this level maps to.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Minimal => "warn",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub log_level: LogLevel,
    pub upstream_base_url: String,
    pub upstream_api_path: String,
    pub upstream_api_key: String,
}

impl Config {
    /// Read configuration from the environment. Errors are startup failures.
    pub fn from_env() -> Result<Self, String> {
        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .map_err(|_| "UPSTREAM_BASE_URL is not set".to_string())?;
        let upstream_api_key = env::var("UPSTREAM_API_KEY")
            .map_err(|_| "UPSTREAM_API_KEY is not set".to_string())?;

        let listen_port = match env::var("LISTEN_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| format!("LISTEN_PORT is not a valid port: {}", raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let log_level = match env::var("LOG_LEVEL") {
            Ok(raw) => LogLevel::parse(&raw)
                .ok_or_else(|| format!("LOG_LEVEL must be debug|info|minimal, got: {}", raw))?,
            Err(_) => LogLevel::Info,
        };

        let upstream_api_path =
            env::var("UPSTREAM_API_PATH").unwrap_or_else(|_| DEFAULT_API_PATH.to_string());

        Ok(Config {
            listen_port,
            log_level,
            upstream_base_url: upstream_base_url.trim_end_matches('/').to_string(),
            upstream_api_path,
            upstream_api_key,
        })
    }
}
