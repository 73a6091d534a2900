use std::path::PathBuf;
use std::time::Duration;

/// Server settings, read from `GYMDESK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    /// Directory holding the event log.
    pub data_dir: PathBuf,
    /// Shared secret every connection presents at login.
    pub password: String,
    pub max_connections: usize,
    /// Log appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    /// How often lapsed plan assignments are deactivated.
    pub expiry_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "gymdesk".into(),
            max_connections: 256,
            compact_threshold: 1000,
            expiry_interval: Duration::from_secs(3600),
            metrics_port: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed("GYMDESK_PORT").unwrap_or(defaults.port),
            bind: std::env::var("GYMDESK_BIND").unwrap_or(defaults.bind),
            data_dir: std::env::var("GYMDESK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: std::env::var("GYMDESK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed("GYMDESK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed("GYMDESK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            expiry_interval: parsed("GYMDESK_EXPIRY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expiry_interval),
            metrics_port: parsed("GYMDESK_METRICS_PORT"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("gymdesk.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        let config = Config {
            bind: "127.0.0.1".into(),
            port: 7000,
            data_dir: PathBuf::from("/var/lib/gymdesk"),
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:7000");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/gymdesk/gymdesk.wal"));
    }
}
