use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::Command;

use crate::engine::sink::{EnforcementSurface, LockStatusRecord, StatusMirror};
use crate::platform::common::atomic_write;

/// Enforcement surface for a desktop session. The overlay itself is a
/// separate lock UI process that watches the overlay state file; home
/// redirect and notices go through desktop tooling.
pub struct DesktopSurface {
    overlay_path: PathBuf,
}

impl DesktopSurface {
    pub fn new(overlay_path: impl Into<PathBuf>) -> Self {
        Self {
            overlay_path: overlay_path.into(),
        }
    }
}

impl EnforcementSurface for DesktopSurface {
    fn redirect_home(&self) -> Result<()> {
        // Try multiple methods in order of preference

        // 1. wmctrl show-desktop (works across EWMH window managers)
        if try_command("wmctrl", &["-k", "on"]).is_ok() {
            return Ok(());
        }

        // 2. xdotool show-desktop keybinding
        if try_command("xdotool", &["key", "super+d"]).is_ok() {
            return Ok(());
        }

        // 3. KDE plasma show desktop
        if try_command(
            "qdbus",
            &["org.kde.kglobalaccel", "/component/kwin", "invokeShortcut", "Show Desktop"],
        )
        .is_ok()
        {
            return Ok(());
        }

        anyhow::bail!("No supported show-desktop mechanism found on this system")
    }

    fn set_overlay(&self, visible: bool, reason: &str) -> Result<()> {
        let state = json!({
            "visible": visible,
            "reason": reason,
            "updatedAt": Utc::now().timestamp_millis(),
        });

        let content =
            serde_json::to_string_pretty(&state).context("Failed to serialize overlay state")?;
        atomic_write(&self.overlay_path, content.as_bytes()).with_context(|| {
            format!("Failed to write overlay state: {}", self.overlay_path.display())
        })
    }

    fn notify(&self, title: &str, message: &str) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            Command::new("notify-send")
                .arg(title)
                .arg(message)
                .arg("--urgency=critical")
                .arg("--icon=dialog-warning")
                .output()
                .context("Failed to run notify-send")?;
        }

        #[cfg(target_os = "macos")]
        {
            let script = format!(
                "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
                message, title
            );
            Command::new("osascript")
                .arg("-e")
                .arg(&script)
                .output()
                .context("Failed to run osascript")?;
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            tracing::warn!("Notification: {} - {}", title, message);
        }

        Ok(())
    }
}

/// Status mirror backed by a JSON document the sync layer ships to the
/// parent. Writes merge into the existing document so lock state and
/// presence do not clobber each other.
pub struct FileStatusMirror {
    status_path: PathBuf,
}

impl FileStatusMirror {
    pub fn new(status_path: impl Into<PathBuf>) -> Self {
        Self {
            status_path: status_path.into(),
        }
    }

    fn read_document(&self) -> Value {
        std::fs::read_to_string(&self.status_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_else(|| json!({}))
    }

    fn write_document(&self, value: &Value) -> Result<()> {
        let content =
            serde_json::to_string_pretty(value).context("Failed to serialize status document")?;
        atomic_write(&self.status_path, content.as_bytes()).with_context(|| {
            format!("Failed to write status document: {}", self.status_path.display())
        })
    }
}

impl StatusMirror for FileStatusMirror {
    fn publish_lock_state(&self, record: &LockStatusRecord) -> Result<()> {
        let mut doc = self.read_document();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("isLocked".to_string(), json!(record.is_locked));
            obj.insert("lockReason".to_string(), json!(record.lock_reason));
            obj.insert(
                "lockedAt".to_string(),
                match record.locked_at {
                    Some(ts) => json!(ts.timestamp_millis()),
                    None => Value::Null,
                },
            );
            obj.insert("deviceId".to_string(), json!(record.device_id));
        }
        self.write_document(&doc)
    }

    fn publish_presence(&self, online: bool, device_id: &str) -> Result<()> {
        let mut doc = self.read_document();
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("isOnline".to_string(), json!(online));
            obj.insert(
                "lastSeen".to_string(),
                json!(Utc::now().timestamp_millis()),
            );
            obj.insert("deviceId".to_string(), json!(device_id));
        }
        self.write_document(&doc)
    }
}

fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd).args(args).output()?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("Command failed: {} {:?}", cmd, args)
    }
}
