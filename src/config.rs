use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Package identifier of this agent; never treated as blockable.
    #[serde(default = "default_own_package")]
    pub own_package: String,

    /// File locations shared with the sync layer and the lock UI
    #[serde(default)]
    pub paths: PathsConfig,

    /// Loop cadences, all in seconds
    #[serde(default)]
    pub cadence: CadenceConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_own_package() -> String {
    "com.kidguard.agent".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            own_package: default_own_package(),
            paths: PathsConfig::default(),
            cadence: CadenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// File locations. Unset entries resolve against the platform data
/// directory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Parent-synced settings document (JSON)
    pub settings_file: Option<PathBuf>,

    /// Synced blocklist: a JSON array of package identifiers
    pub blocklist_file: Option<PathBuf>,

    /// Persisted usage counters
    pub usage_file: Option<PathBuf>,

    /// Parent-facing lock/presence status document
    pub status_file: Option<PathBuf>,

    /// Overlay state file consumed by the lock UI
    pub overlay_file: Option<PathBuf>,
}

impl PathsConfig {
    pub fn settings_path(&self) -> Result<PathBuf> {
        self.resolve(&self.settings_file, "kid_guard_settings.json")
    }

    pub fn blocklist_path(&self) -> Result<PathBuf> {
        self.resolve(&self.blocklist_file, "blocked_apps.json")
    }

    pub fn usage_path(&self) -> Result<PathBuf> {
        self.resolve(&self.usage_file, "usage.json")
    }

    pub fn status_path(&self) -> Result<PathBuf> {
        self.resolve(&self.status_file, "device_status.json")
    }

    pub fn overlay_path(&self) -> Result<PathBuf> {
        self.resolve(&self.overlay_file, "overlay.json")
    }

    fn resolve(&self, configured: &Option<PathBuf>, file_name: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(path.clone()),
            None => Ok(get_data_dir()?.join(file_name)),
        }
    }
}

/// Loop cadences in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CadenceConfig {
    /// Usage/evaluation tick
    #[serde(default = "default_tick")]
    pub tick_seconds: u64,

    /// Settings file poll
    #[serde(default = "default_settings_poll")]
    pub settings_poll_seconds: u64,

    /// Blocklist file refresh
    #[serde(default = "default_blocklist_refresh")]
    pub blocklist_refresh_seconds: u64,

    /// Status line refresh and presence heartbeat
    #[serde(default = "default_status_refresh")]
    pub status_refresh_seconds: u64,
}

fn default_tick() -> u64 {
    1
}

fn default_settings_poll() -> u64 {
    5
}

fn default_blocklist_refresh() -> u64 {
    30
}

fn default_status_refresh() -> u64 {
    30
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick(),
            settings_poll_seconds: default_settings_poll(),
            blocklist_refresh_seconds: default_blocklist_refresh(),
            status_refresh_seconds: default_status_refresh(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: EngineConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Validate configuration
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.own_package.trim().is_empty() {
        anyhow::bail!("own_package must not be empty");
    }

    let cadence = &config.cadence;
    if cadence.tick_seconds == 0 {
        anyhow::bail!("cadence.tick_seconds must be at least 1");
    }
    if cadence.settings_poll_seconds == 0 {
        anyhow::bail!("cadence.settings_poll_seconds must be at least 1");
    }
    if cadence.blocklist_refresh_seconds == 0 {
        anyhow::bail!("cadence.blocklist_refresh_seconds must be at least 1");
    }
    if cadence.status_refresh_seconds == 0 {
        anyhow::bail!("cadence.status_refresh_seconds must be at least 1");
    }

    Ok(())
}

/// Save configuration to a YAML file
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config).context("Failed to serialize configuration")?;

    crate::platform::common::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Get the platform-specific config file path
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // System location first, then per-user fallback
        let system_path = PathBuf::from("/etc/kid-guard/config.yaml");
        if system_path.exists() {
            return Ok(system_path);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "kid-guard") {
        return Ok(dirs.config_dir().join("config.yaml"));
    }

    anyhow::bail!("Could not determine config directory")
}

/// Get the platform-specific data directory for synced and persisted files
pub fn get_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/var/lib/kid-guard");
        if system_path.exists() {
            return Ok(system_path);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "kid-guard") {
        return Ok(dirs.data_local_dir().to_path_buf());
    }

    anyhow::bail!("Could not determine data directory")
}

/// Example configuration file with comprehensive documentation
///
/// The content is loaded from example-config.yaml at compile time
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");
