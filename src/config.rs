//! Typed configuration from `EXAMBOOK_*` environment variables.
//!
//! Loaded once at startup. A variable that is set but does not parse is an
//! error rather than a silent fallback to the default.

use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// Newline-delimited roster of known workers. Unset accepts any reference.
    pub workers_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_var("EXAMBOOK_PORT", get("EXAMBOOK_PORT"))?.unwrap_or(5433),
            bind: get("EXAMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("EXAMBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: get("EXAMBOOK_PASSWORD").unwrap_or_else(|| "exambook".into()),
            max_connections: parse_var("EXAMBOOK_MAX_CONNECTIONS", get("EXAMBOOK_MAX_CONNECTIONS"))?
                .unwrap_or(256),
            compact_threshold: parse_var(
                "EXAMBOOK_COMPACT_THRESHOLD",
                get("EXAMBOOK_COMPACT_THRESHOLD"),
            )?
            .unwrap_or(1000),
            tls_cert: get("EXAMBOOK_TLS_CERT"),
            tls_key: get("EXAMBOOK_TLS_KEY"),
            metrics_port: parse_var("EXAMBOOK_METRICS_PORT", get("EXAMBOOK_METRICS_PORT"))?,
            workers_file: get("EXAMBOOK_WORKERS_FILE").map(PathBuf::from),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value: v }),
    }
}
