//! Process settings from the environment (after `.env` is loaded).

use crate::error::ConfigError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Absent selects the in-memory store.
    pub database_url: Option<String>,
    pub catalog_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    pub stream_heartbeat: Duration,
    pub body_limit_bytes: usize,
    pub nested_writes: bool,
    pub logging: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: None,
            catalog_path: PathBuf::from("catalog"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            db_max_connections: 5,
            stream_heartbeat: Duration::from_secs(15),
            body_limit_bytes: 2 * 1024 * 1024,
            nested_writes: false,
            logging: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();
        Ok(Settings {
            database_url: get("DATABASE_URL"),
            catalog_path: get("CATALOG_PATH").map(PathBuf::from).unwrap_or(defaults.catalog_path),
            bind_addr: parsed(get("BIND_ADDR"), "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            db_max_connections: parsed(get("DB_MAX_CONNECTIONS"), "DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            stream_heartbeat: parsed::<u64>(get("STREAM_HEARTBEAT_SECS"), "STREAM_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stream_heartbeat),
            body_limit_bytes: parsed(get("BODY_LIMIT_BYTES"), "BODY_LIMIT_BYTES")?.unwrap_or(defaults.body_limit_bytes),
            nested_writes: match get("NESTED_WRITES") {
                Some(v) => flag(&v).ok_or_else(|| ConfigError::Setting {
                    name: "NESTED_WRITES",
                    reason: format!("expected a boolean, got \"{}\"", v),
                })?,
                None => defaults.nested_writes,
            },
            logging: get("LOGGING"),
        })
    }
}

fn parsed<T>(raw: Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| {
        v.parse::<T>().map_err(|e| ConfigError::Setting {
            name,
            reason: format!("\"{}\": {}", v, e),
        })
    })
    .transpose()
}

fn flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
