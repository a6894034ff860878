//! Server configuration from `ROOMBOOK_*` environment variables.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

use crate::engine::EngineConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("both ROOMBOOK_TLS_CERT and ROOMBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub weekly_quota: u32,
    pub timezone: Tz,
    pub secret_key: String,
    pub admins: HashSet<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("max_connections", &self.max_connections)
            .field("compact_threshold", &self.compact_threshold)
            .field("weekly_quota", &self.weekly_quota)
            .field("timezone", &self.timezone)
            .field("admins", &self.admins)
            .field("tls", &self.tls_cert.is_some())
            .field("metrics_port", &self.metrics_port)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Read the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let weekly_quota: u32 = parse_or(&get, "ROOMBOOK_WEEKLY_QUOTA", "positive integer", 5)?;
        if weekly_quota == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOMBOOK_WEEKLY_QUOTA",
                expected: "positive integer",
                value: "0".into(),
            });
        }

        let timezone = match get("ROOMBOOK_TIMEZONE") {
            Some(name) => name.trim().parse::<Tz>().map_err(|_| ConfigError::Invalid {
                var: "ROOMBOOK_TIMEZONE",
                expected: "IANA time zone",
                value: name,
            })?,
            None => chrono_tz::America::New_York,
        };

        let tls_cert = get("ROOMBOOK_TLS_CERT");
        let tls_key = get("ROOMBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let metrics_port = match get("ROOMBOOK_METRICS_PORT") {
            Some(v) => Some(v.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "ROOMBOOK_METRICS_PORT",
                expected: "port",
                value: v,
            })?),
            None => None,
        };

        let admins = get("ROOMBOOK_ADMINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind: get("ROOMBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "ROOMBOOK_PORT", "port", 5433)?,
            data_dir: get("ROOMBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("ROOMBOOK_PASSWORD").unwrap_or_else(|| "roombook".into()),
            max_connections: parse_or(&get, "ROOMBOOK_MAX_CONNECTIONS", "positive integer", 256)?,
            compact_threshold: parse_or(&get, "ROOMBOOK_COMPACT_THRESHOLD", "positive integer", 1000)?,
            weekly_quota,
            timezone,
            secret_key: get("ROOMBOOK_SECRET_KEY").ok_or(ConfigError::Missing("ROOMBOOK_SECRET_KEY"))?,
            admins,
            tls_cert,
            tls_key,
            metrics_port,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            weekly_quota: self.weekly_quota,
            tz: self.timezone,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value: v,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_with_secret() {
        let cfg = config(&[("ROOMBOOK_SECRET_KEY", "k")]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.password, "roombook");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.weekly_quota, 5);
        assert_eq!(cfg.timezone, chrono_tz::America::New_York);
        assert!(cfg.admins.is_empty());
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn secret_is_required() {
        assert_eq!(
            config(&[]).unwrap_err(),
            ConfigError::Missing("ROOMBOOK_SECRET_KEY")
        );
        assert!(config(&[("ROOMBOOK_SECRET_KEY", "  ")]).is_err());
    }

    #[test]
    fn overrides_and_admin_list() {
        let cfg = config(&[
            ("ROOMBOOK_SECRET_KEY", "k"),
            ("ROOMBOOK_PORT", "6543"),
            ("ROOMBOOK_WEEKLY_QUOTA", "3"),
            ("ROOMBOOK_TIMEZONE", "Europe/Berlin"),
            ("ROOMBOOK_ADMINS", "ab1, cd2,,"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6543);
        assert_eq!(cfg.engine_config().weekly_quota, 3);
        assert_eq!(cfg.timezone, chrono_tz::Europe::Berlin);
        assert!(cfg.admins.contains("ab1") && cfg.admins.contains("cd2"));
        assert_eq!(cfg.admins.len(), 2);
    }

    #[test]
    fn rejects_bad_values() {
        let secret = ("ROOMBOOK_SECRET_KEY", "k");
        assert!(matches!(
            config(&[secret, ("ROOMBOOK_PORT", "eighty")]),
            Err(ConfigError::Invalid { var: "ROOMBOOK_PORT", .. })
        ));
        assert!(matches!(
            config(&[secret, ("ROOMBOOK_WEEKLY_QUOTA", "0")]),
            Err(ConfigError::Invalid { var: "ROOMBOOK_WEEKLY_QUOTA", .. })
        ));
        assert!(matches!(
            config(&[secret, ("ROOMBOOK_TIMEZONE", "Mars/Olympus")]),
            Err(ConfigError::Invalid { var: "ROOMBOOK_TIMEZONE", .. })
        ));
        assert_eq!(
            config(&[secret, ("ROOMBOOK_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::PartialTls
        );
    }

    #[test]
    fn debug_hides_secrets() {
        let cfg = config(&[("ROOMBOOK_SECRET_KEY", "hunter2"), ("ROOMBOOK_PASSWORD", "pw")]).unwrap();
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("\"pw\""));
    }
}
