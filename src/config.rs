//! TOML configuration for the HotReel daemon.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::{ParamError, RunParameters};
use crate::worker::CommandWorkerConfig;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "HOTREEL_CONFIG";
/// Standard system location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hotreel/hotreel.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotReelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: CommandWorkerConfig,
    #[serde(default)]
    pub recurring: RecurringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HotReelConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (an error if it cannot be loaded).
    /// 2. The path in `HOTREEL_CONFIG`.
    /// 3. `/etc/hotreel/hotreel.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HOTREEL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid [server] bind address '{}'", self.server.bind))?;
        if self.scheduler.event_queue_capacity == 0 {
            anyhow::bail!("[scheduler] event_queue_capacity must be at least 1");
        }
        if let Some(params) = self.recurring.params() {
            params
                .validate()
                .map_err(|e: ParamError| anyhow::anyhow!("invalid [recurring] section: {e}"))?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5001".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding run history.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/hotreel.db"),
        }
    }
}

/// Run orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds a stopped worker gets before the run is abandoned.
    pub stop_grace_secs: u64,
    /// Per-observer event queue depth.
    pub event_queue_capacity: usize,
    /// History entries returned when the caller gives no limit.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 30,
            event_queue_capacity: crate::events::DEFAULT_CAPACITY,
            history_limit: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Recurring mode armed at daemon start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringConfig {
    pub enabled: bool,
    pub item_count: u32,
    pub headless: bool,
    pub interval_minutes: u32,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            item_count: 3,
            headless: true,
            interval_minutes: 30,
        }
    }
}

impl RecurringConfig {
    /// Parameters to arm with, if enabled.
    pub fn params(&self) -> Option<RunParameters> {
        self.enabled.then(|| {
            RunParameters::every(self.item_count, self.headless, self.interval_minutes)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg: HotReelConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:5001");
        assert_eq!(cfg.scheduler.stop_grace_secs, 30);
        assert_eq!(cfg.scheduler.history_limit, 5);
        assert!(cfg.recurring.params().is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let cfg: HotReelConfig = toml::from_str(
            r#"
            [worker]
            program = "/usr/bin/collector"

            [recurring]
            enabled = true
            interval_minutes = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker.program, "/usr/bin/collector");
        assert_eq!(cfg.worker.file_prefix, "iqiyi_");
        assert_eq!(
            cfg.recurring.params(),
            Some(RunParameters::every(3, true, 60))
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_short_recurring_interval() {
        let mut cfg = HotReelConfig::default();
        cfg.recurring.enabled = true;
        cfg.recurring.interval_minutes = 10;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("[recurring]"));
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let mut cfg = HotReelConfig::default();
        cfg.server.bind = "not-an-addr".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = HotReelConfig::default();
        cfg.logging.json = true;
        let text = cfg.to_toml().unwrap();
        let back: HotReelConfig = toml::from_str(&text).unwrap();
        assert!(back.logging.json);
        assert_eq!(back.storage.db_path, cfg.storage.db_path);
    }

    #[test]
    fn test_explicit_path_errors_are_surfaced() {
        assert!(HotReelConfig::resolve(Some(Path::new("/nonexistent/hotreel.toml"))).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"127.0.0.1:9000\"").unwrap();
        let cfg = HotReelConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
    }
}
