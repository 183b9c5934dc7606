//! Environment configuration for the ledger.
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_DATABASE: &str = "webbank";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Placeholder credentials found in sample connection strings.
const PLACEHOLDER_CREDENTIALS: &str = "username:password";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Prepared primary connection string, `None` when the primary is not configured.
    pub primary_uri: Option<String>,
    pub database: String,
    pub data_dir: PathBuf,
    pub fallback_writable: bool,
    pub call_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = lookup("MONGODB_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let primary_uri = match lookup("MONGODB_URI") {
            Some(raw) => prepare_primary_uri(&raw, &database),
            None => None,
        };
        if primary_uri.is_none() {
            info!("MongoDB URI not configured, using local JSON files");
        }

        let data_dir = PathBuf::from(
            lookup("LEDGER_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
        );

        let fallback_writable = match lookup("LEDGER_FALLBACK_WRITABLE") {
            Some(value) => parse_flag("LEDGER_FALLBACK_WRITABLE", &value)?,
            None => {
                let serverless = lookup("VERCEL").as_deref() == Some("1");
                let production = lookup("NODE_ENV").as_deref() == Some("production");
                !(serverless || production)
            }
        };
        if !fallback_writable {
            warn!("Fallback store is read-only in this deployment");
        }

        let timeout_ms: u64 = try_load(&lookup, "LEDGER_BACKEND_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?;

        Ok(Config {
            primary_uri,
            database,
            data_dir,
            fallback_writable,
            call_timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    match lookup(key) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                warn!("Invalid {key} value: {value}");
                Err(ConfigError::InvalidValue { key, value })
            }
        },
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

/// Makes a raw connection string usable by the driver.
///
/// Any `@` inside the credentials is percent-encoded, and an empty path is replaced
/// by `database`. Returns `None` for empty strings and the sample placeholder.
pub fn prepare_primary_uri(raw: &str, database: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(PLACEHOLDER_CREDENTIALS) {
        return None;
    }

    let (scheme, rest) = match raw.find("://") {
        Some(idx) => raw.split_at(idx + 3),
        None => ("", raw),
    };

    // Neither the host nor the path holds '@', so the last one before the query
    // ends the credentials.
    let query_start = rest.find('?').unwrap_or(rest.len());
    let (credentials, location) = match rest[..query_start].rfind('@') {
        Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
        None => (None, rest),
    };

    let (host, path_and_query) = match location.find(['/', '?']) {
        Some(idx) => location.split_at(idx),
        None => (location, ""),
    };
    let (path, query) = match path_and_query.find('?') {
        Some(idx) => path_and_query.split_at(idx),
        None => (path_and_query, ""),
    };
    let path = match path.trim_start_matches('/') {
        "" => format!("/{database}"),
        named => format!("/{named}"),
    };

    let mut uri = String::with_capacity(raw.len() + database.len() + 4);
    uri.push_str(scheme);
    if let Some(credentials) = credentials {
        uri.push_str(&credentials.replace('@', "%40"));
        uri.push('@');
    }
    uri.push_str(host);
    uri.push_str(&path);
    uri.push_str(query);
    Some(uri)
}
