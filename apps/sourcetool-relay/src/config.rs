use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not a valid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub relay_instance_id: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub edition: Edition,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = parse_var("SOURCETOOL_RELAY_ADDR", "0.0.0.0:8080".parse().ok())?;
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sourcetool_relay=debug".into());
        let relay_instance_id = std::env::var("SOURCETOOL_INSTANCE_ID")
            .unwrap_or_else(|_| format!("relay-{}", uuid::Uuid::new_v4()));
        let database_url = non_empty("DATABASE_URL");
        let redis_url = non_empty("REDIS_URL");
        let jwt_secret = non_empty("SOURCETOOL_JWT_SECRET");
        let edition = Edition::from_env()?;
        let ping_period = Duration::from_secs(parse_var("SOURCETOOL_PING_PERIOD_SECS", Some(30))?);
        let write_wait = Duration::from_secs(parse_var("SOURCETOOL_WRITE_WAIT_SECS", Some(10))?);
        Ok(Self {
            bind_addr,
            log_filter,
            relay_instance_id,
            database_url,
            redis_url,
            jwt_secret,
            edition,
            ping_period,
            write_wait,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    Base,
    Extended,
}

impl Edition {
    fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("SOURCETOOL_EDITION")
            .unwrap_or_else(|_| "base".into())
            .as_str()
        {
            "base" | "ce" => Ok(Edition::Base),
            "extended" | "ee" => Ok(Edition::Extended),
            other => Err(ConfigError::Invalid {
                name: "SOURCETOOL_EDITION",
                value: other.to_string(),
            }),
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: Option<T>,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => default.ok_or(ConfigError::Invalid {
            name,
            value: String::new(),
        }),
    }
}
