use std::path::Path;

use anyhow::{anyhow, Result};
use serde_derive::{Deserialize, Serialize};

/// Server configuration, loadable from a TOML file and overridable from the
/// command line. Every knob has a default so an empty config works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Bind address, `host:port`.
    pub bind: Option<String>,

    /// SQLite database path. `:memory:`-style throwaway stores are only
    /// used by tests; the server wants a real file.
    pub db_path: Option<String>,

    /// Row-store connection pool size.
    pub pool_size: Option<u32>,

    pub log_level: Option<String>,

    /// Entry-expiry sweep interval, ms.
    pub sweep_interval_ms: Option<u64>,

    /// Queue lease-recovery sweep interval, ms.
    pub lease_sweep_interval_ms: Option<u64>,

    /// Watch endpoints poll the store this often, ms.
    pub watch_poll_ms: Option<u64>,

    /// Queue listen/SSE endpoints poll this often when idle, ms.
    pub queue_poll_ms: Option<u64>,

    /// Whether metric aggregates are flushed into the metrics table.
    pub metrics_persist: Option<bool>,

    pub metrics_flush_interval_ms: Option<u64>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            bind: Some("127.0.0.1:7381".to_string()),
            db_path: Some("tidekv.db".to_string()),
            pool_size: Some(8),
            log_level: Some("info".to_string()),
            sweep_interval_ms: Some(60_000),
            lease_sweep_interval_ms: Some(60_000),
            watch_poll_ms: Some(100),
            queue_poll_ms: Some(1000),
            metrics_persist: Some(false),
            metrics_flush_interval_ms: Some(30_000),
        }
    }
}

impl ConfigLoad {
    /// Reads a TOML config file, filling gaps with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("cannot read config {}: {}", path.display(), e))?;
        let loaded: ConfigLoad =
            toml::from_str(&text).map_err(|e| anyhow!("bad config {}: {}", path.display(), e))?;
        Ok(loaded.merged_with_defaults())
    }

    fn merged_with_defaults(mut self) -> Self {
        let defaults = ConfigLoad::default();
        self.bind = self.bind.or(defaults.bind);
        self.db_path = self.db_path.or(defaults.db_path);
        self.pool_size = self.pool_size.or(defaults.pool_size);
        self.log_level = self.log_level.or(defaults.log_level);
        self.sweep_interval_ms = self.sweep_interval_ms.or(defaults.sweep_interval_ms);
        self.lease_sweep_interval_ms =
            self.lease_sweep_interval_ms.or(defaults.lease_sweep_interval_ms);
        self.watch_poll_ms = self.watch_poll_ms.or(defaults.watch_poll_ms);
        self.queue_poll_ms = self.queue_poll_ms.or(defaults.queue_poll_ms);
        self.metrics_persist = self.metrics_persist.or(defaults.metrics_persist);
        self.metrics_flush_interval_ms =
            self.metrics_flush_interval_ms.or(defaults.metrics_flush_interval_ms);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == Some(0) {
            return Err(anyhow!("pool_size must be at least 1"));
        }
        if self.watch_poll_ms == Some(0) {
            return Err(anyhow!("watch_poll_ms must be at least 1"));
        }
        if let Some(bind) = &self.bind {
            bind.parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow!("bad bind address {}: {}", bind, e))?;
        }
        Ok(())
    }

    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or("127.0.0.1:7381")
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("tidekv.db")
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn watch_poll_ms(&self) -> u64 {
        self.watch_poll_ms.unwrap_or(100).max(1)
    }

    pub fn queue_poll_ms(&self) -> u64 {
        self.queue_poll_ms.unwrap_or(1000).max(1)
    }

    pub fn sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms.unwrap_or(60_000).max(100)
    }

    pub fn lease_sweep_interval_ms(&self) -> u64 {
        self.lease_sweep_interval_ms.unwrap_or(60_000).max(100)
    }

    pub fn metrics_persist(&self) -> bool {
        self.metrics_persist.unwrap_or(false)
    }

    pub fn metrics_flush_interval_ms(&self) -> u64 {
        self.metrics_flush_interval_ms.unwrap_or(30_000).max(100)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConfigLoad::default();
        config.validate().unwrap();
        assert_eq!(config.watch_poll_ms(), 100);
        assert_eq!(config.queue_poll_ms(), 1000);
        assert!(!config.metrics_persist());
    }

    #[test]
    fn partial_file_merges_with_defaults() {
        let parsed: ConfigLoad = toml::from_str(
            "version = 0\nbind = \"0.0.0.0:9000\"\nwatch_poll_ms = 50\n",
        )
        .unwrap();
        let config = parsed.merged_with_defaults();
        assert_eq!(config.bind(), "0.0.0.0:9000");
        assert_eq!(config.watch_poll_ms(), 50);
        // Untouched knobs fall back.
        assert_eq!(config.sweep_interval_ms(), 60_000);
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut config = ConfigLoad::default();
        config.pool_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = ConfigLoad::default();
        config.bind = Some("not-an-address".into());
        assert!(config.validate().is_err());
    }
}
