use std::path::PathBuf;
use std::str::FromStr;

use crate::model::{Ms, MINUTE_MS};

/// Certificate and key files for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once at startup from `FLEETBOOK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub buffer: Ms,
    pub tls: Option<TlsPaths>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "fleetbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            buffer: 60 * MINUTE_MS,
            tls: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Only one of `FLEETBOOK_TLS_CERT` / `FLEETBOOK_TLS_KEY` was set.
    IncompleteTls,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IncompleteTls => write!(
                f,
                "both FLEETBOOK_TLS_CERT and FLEETBOOK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tls = match (lookup("FLEETBOOK_TLS_CERT"), lookup("FLEETBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Self {
            port: parse_var(&lookup, "FLEETBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("FLEETBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("FLEETBOOK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("FLEETBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "FLEETBOOK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "FLEETBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "FLEETBOOK_METRICS_PORT"),
            buffer: parse_var::<u32>(&lookup, "FLEETBOOK_BUFFER_MINUTES")
                .map_or(defaults.buffer, |m| Ms::from(m) * MINUTE_MS),
            tls,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fleetbook.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.buffer, 3_600_000);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/fleetbook.wal"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("FLEETBOOK_PORT", "6543"),
            ("FLEETBOOK_BIND", "127.0.0.1"),
            ("FLEETBOOK_DATA_DIR", "/var/lib/fleetbook"),
            ("FLEETBOOK_MAX_CONNECTIONS", "16"),
            ("FLEETBOOK_COMPACT_THRESHOLD", "50"),
            ("FLEETBOOK_METRICS_PORT", "9090"),
            ("FLEETBOOK_BUFFER_MINUTES", "30"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6543");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/fleetbook"));
        assert_eq!(cfg.max_connections, 16);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9090));
        assert_eq!(cfg.buffer, 30 * MINUTE_MS);
    }

    #[test]
    fn garbage_falls_back() {
        let cfg = config(&[
            ("FLEETBOOK_PORT", "not-a-port"),
            ("FLEETBOOK_BUFFER_MINUTES", "-5"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.buffer, 60 * MINUTE_MS);
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            config(&[("FLEETBOOK_TLS_CERT", "cert.pem")]),
            Err(ConfigError::IncompleteTls)
        );
        let cfg = config(&[
            ("FLEETBOOK_TLS_CERT", "cert.pem"),
            ("FLEETBOOK_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(
            cfg.tls,
            Some(TlsPaths {
                cert: "cert.pem".into(),
                key: "key.pem".into(),
            })
        );
    }
}
