use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing;

#[derive(Debug, Clone, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl LabConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<LabConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using LabConfig::default().",
                path.display()
            );
            LabConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    /// Defaults with every path anchored under `root`. Handy for tests.
    pub fn rooted(root: &Path) -> Self {
        let mut cfg = LabConfig::default();
        cfg.resolve_paths(root);
        cfg
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.storage.sessions_dir = absolutize(root, &self.storage.sessions_dir);
        self.storage.registry_path = absolutize(root, &self.storage.registry_path);
        self.storage.mirror_path = absolutize(root, &self.storage.mirror_path);
        self.storage.aggregate_report = absolutize(root, &self.storage.aggregate_report);
        self.audit.path = absolutize(root, &self.audit.path);
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            logger: LoggerConfig::default(),
            presence: PresenceConfig::default(),
            capacity: CapacityConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_sessions_dir")]
    pub sessions_dir: PathBuf,
    #[serde(default = "StorageConfig::default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "StorageConfig::default_mirror_path")]
    pub mirror_path: PathBuf,
    #[serde(default = "StorageConfig::default_aggregate_report")]
    pub aggregate_report: PathBuf,
}

impl StorageConfig {
    fn default_sessions_dir() -> PathBuf {
        PathBuf::from("sessions")
    }

    fn default_registry_path() -> PathBuf {
        PathBuf::from("registry/presence.db")
    }

    fn default_mirror_path() -> PathBuf {
        PathBuf::from("registry/mirror.db")
    }

    fn default_aggregate_report() -> PathBuf {
        PathBuf::from("analytics/aggregate_report.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_dir: Self::default_sessions_dir(),
            registry_path: Self::default_registry_path(),
            mirror_path: Self::default_mirror_path(),
            aggregate_report: Self::default_aggregate_report(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggerConfig {
    /// Auto-flush after this many buffered events (0 disables count-based flushing).
    #[serde(default = "LoggerConfig::default_flush_every")]
    pub flush_every: usize,
    #[serde(default = "LoggerConfig::default_mirror_enabled")]
    pub mirror_enabled: bool,
}

impl LoggerConfig {
    fn default_flush_every() -> usize {
        10
    }

    fn default_mirror_enabled() -> bool {
        true
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            flush_every: Self::default_flush_every(),
            mirror_enabled: Self::default_mirror_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "PresenceConfig::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "PresenceConfig::default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "PresenceConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl PresenceConfig {
    fn default_heartbeat_interval_secs() -> u64 {
        20
    }

    fn default_liveness_timeout_secs() -> u64 {
        60
    }

    fn default_busy_timeout_ms() -> u64 {
        5_000
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: Self::default_heartbeat_interval_secs(),
            liveness_timeout_secs: Self::default_liveness_timeout_secs(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    /// When false every admission succeeds (developer sessions).
    #[serde(default = "CapacityConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "CapacityConfig::default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "CapacityConfig::default_avg_learning_minutes")]
    pub avg_learning_minutes: u32,
}

impl CapacityConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_concurrent() -> usize {
        2
    }

    fn default_avg_learning_minutes() -> u32 {
        30
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_concurrent: Self::default_max_concurrent(),
            avg_learning_minutes: Self::default_avg_learning_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AuditConfig::default_path")]
    pub path: PathBuf,
}

impl AuditConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_path() -> PathBuf {
        PathBuf::from("logbook/actions.jsonl")
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            path: Self::default_path(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: LabConfig = toml::from_str(
            r#"
            [capacity]
            max_concurrent = 5

            [presence]
            liveness_timeout_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(cfg.capacity.max_concurrent, 5);
        assert!(cfg.capacity.enabled);
        assert_eq!(cfg.presence.liveness_timeout(), Duration::from_secs(90));
        assert_eq!(cfg.presence.heartbeat_interval_secs, 20);
        assert_eq!(cfg.logger.flush_every, 10);
    }

    #[test]
    fn relative_paths_are_anchored_at_root() {
        let cfg = LabConfig::rooted(Path::new("/srv/study"));
        assert_eq!(cfg.storage.sessions_dir, PathBuf::from("/srv/study/sessions"));
        assert_eq!(cfg.audit.path, PathBuf::from("/srv/study/logbook/actions.jsonl"));
    }
}
