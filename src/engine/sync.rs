use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::engine::settings::Settings;
use crate::platform::common::atomic_write;

/// One detected settings change.
#[derive(Debug, Clone)]
pub struct SettingsUpdate {
    pub settings: Settings,
    /// Edge-triggered remote unlock pulse. Consumed exactly once; the
    /// on-disk flag has already been cleared when this is true.
    pub unlock_requested: bool,
}

/// Polls the synced settings file and reports changes by content hash, so
/// rewrites of identical content cost nothing. Last-known-good settings
/// survive any unreadable intermediate state.
pub struct SettingsWatcher {
    path: PathBuf,
    last_hash: Option<String>,
    current: Settings,
}

impl SettingsWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_hash: None,
            current: Settings::default(),
        }
    }

    pub fn current(&self) -> &Settings {
        &self.current
    }

    /// Check the file once. Returns an update only when the content hash
    /// differs from the last applied snapshot.
    pub fn poll(&mut self) -> Option<SettingsUpdate> {
        let content = match self.read_content() {
            Ok(content) => content,
            Err(e) => {
                warn!("Settings file unreadable, keeping current settings: {:#}", e);
                return None;
            }
        };

        let hash = content_hash(&content);
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return None;
        }

        let settings = if content.is_empty() {
            Settings::default()
        } else {
            match serde_json::from_str::<Value>(&content) {
                Ok(value) => Settings::from_json_value(&value),
                Err(e) => {
                    // Remember the bad content so the warning fires once per
                    // distinct corruption, not once per poll.
                    warn!("Settings file is not valid JSON, keeping current settings: {:#}", e);
                    self.last_hash = Some(hash);
                    return None;
                }
            }
        };

        self.last_hash = Some(hash);

        let unlock_requested = settings.unlock_requested && !settings.is_locked;
        if unlock_requested {
            info!("Remote unlock request detected");
            if let Err(e) = self.clear_unlock_flag(&content) {
                warn!("Failed to clear unlock-request flag: {:#}", e);
            }
        }

        debug!("Settings changed, applying new snapshot");
        self.current = settings.clone();
        Some(SettingsUpdate {
            settings,
            unlock_requested,
        })
    }

    fn read_content(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings file: {}", self.path.display()))
    }

    /// Write the document back with `unlockRequested` reset, preserving
    /// every other field verbatim, then adopt the rewritten content's hash
    /// so the write-back does not read as another change.
    fn clear_unlock_flag(&mut self, content: &str) -> Result<()> {
        let mut value: Value = serde_json::from_str(content)
            .context("Settings document disappeared between parse and write-back")?;

        if let Some(obj) = value.as_object_mut() {
            obj.insert("unlockRequested".to_string(), Value::Bool(false));
        }

        let rewritten =
            serde_json::to_string_pretty(&value).context("Failed to serialize settings")?;
        atomic_write(&self.path, rewritten.as_bytes())
            .with_context(|| format!("Failed to write settings file: {}", self.path.display()))?;

        self.last_hash = Some(content_hash(&rewritten));
        Ok(())
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
