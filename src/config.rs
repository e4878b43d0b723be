use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 5433;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_PASSWORD: &str = "slotswap";
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Server settings, read from `SLOTSWAP_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parsed(&lookup, "SLOTSWAP_PORT").unwrap_or(DEFAULT_PORT),
            bind: lookup("SLOTSWAP_BIND").unwrap_or_else(|| DEFAULT_BIND.into()),
            data_dir: lookup("SLOTSWAP_DATA_DIR")
                .unwrap_or_else(|| DEFAULT_DATA_DIR.into())
                .into(),
            password: lookup("SLOTSWAP_PASSWORD").unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            max_connections: parsed(&lookup, "SLOTSWAP_MAX_CONNECTIONS")
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            compact_threshold: parsed(&lookup, "SLOTSWAP_COMPACT_THRESHOLD")
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: parsed(&lookup, "SLOTSWAP_METRICS_PORT"),
            tls_cert: lookup("SLOTSWAP_TLS_CERT"),
            tls_key: lookup("SLOTSWAP_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
