use std::{env, str::FromStr, time::Duration};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub enabled: bool,
    pub size: usize,
    pub flush_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    /// Base URL the gateway calls back on, without a trailing slash.
    pub public_base_url: String,
    pub gateway: GatewayConfig,
    pub batching: BatchConfig,
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn first_of(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str], default: &str) -> String {
    keys.iter()
        .find_map(|key| non_empty(lookup, key))
        .unwrap_or_else(|| default.to_string())
}

fn number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match non_empty(lookup, key) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

/// Like [`number`], but zero is rejected; used for timer periods.
fn nonzero(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match number(lookup, key, default)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        value => Ok(value),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    match non_empty(lookup, key) {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

fn resolve_database_url(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = non_empty(lookup, "DATABASE_URL") {
        return url;
    }
    let host = first_of(lookup, &["POSTGRES_HOST", "PGHOST"], "localhost");
    let port = first_of(lookup, &["POSTGRES_PORT", "PGPORT"], "5432");
    let user = first_of(lookup, &["POSTGRES_USER", "PGUSER"], "postgres");
    let password = first_of(lookup, &["POSTGRES_PASSWORD", "PGPASSWORD"], "postgres");
    let db = first_of(lookup, &["POSTGRES_DB", "PGDATABASE"], "ticket_router");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

impl Config {
    /// Reads the process environment, after `.env` has been loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = number(&lookup, "PORT", 4000u16)?;
        let store_backend = match non_empty(&lookup, "STORE_BACKEND")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_string())),
        };
        let public_base_url = non_empty(&lookup, "API_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            base_url: non_empty(&lookup, "EVOLUTION_API_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: non_empty(&lookup, "EVOLUTION_API_KEY"),
            timeout: Duration::from_secs(nonzero(
                &lookup,
                "GATEWAY_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_attempts: number(&lookup, "GATEWAY_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            backoff: Duration::from_millis(number(
                &lookup,
                "GATEWAY_BACKOFF_MS",
                500u64,
            )?),
        };

        let batching = BatchConfig {
            enabled: flag(&lookup, "MESSAGE_BATCHING")?,
            size: number(&lookup, "MESSAGE_BATCH_SIZE", 10usize)?.max(1),
            flush_interval: Duration::from_millis(nonzero(
                &lookup,
                "MESSAGE_BATCH_FLUSH_MS",
                2000u64,
            )?),
        };

        Ok(Self {
            port,
            database_url: resolve_database_url(&lookup),
            store_backend,
            public_base_url,
            gateway,
            batching,
        })
    }
}
