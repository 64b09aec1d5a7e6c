use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Eventually-consistent set of blocked package identifiers. The refresher
/// publishes a whole new set on every update; the evaluation loop only ever
/// sees complete snapshots, never a partially updated one.
#[derive(Clone)]
pub struct BlocklistCache {
    inner: Arc<RwLock<Arc<HashSet<String>>>>,
}

impl BlocklistCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(HashSet::new()))),
        }
    }

    /// Current snapshot. Cheap: clones the Arc, not the set.
    pub async fn snapshot(&self) -> Arc<HashSet<String>> {
        self.inner.read().await.clone()
    }

    /// Replace the whole set atomically.
    pub async fn replace(&self, packages: HashSet<String>) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(packages);
    }
}

impl Default for BlocklistCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the blocklist file: a JSON array of package identifiers. Missing
/// file means an empty blocklist.
pub fn load_blocklist(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read blocklist file: {}", path.display()))?;

    let packages: Vec<String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse blocklist file: {}", path.display()))?;

    Ok(packages.into_iter().collect())
}

/// Background refresh of the blocklist cache from the synced file. On a
/// parse failure the cache keeps its last-known-good snapshot.
pub fn spawn_refresher(cache: BlocklistCache, path: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            match load_blocklist(&path) {
                Ok(packages) => {
                    debug!("Blocklist refreshed: {} packages", packages.len());
                    cache.replace(packages).await;
                }
                Err(e) => {
                    warn!("Blocklist refresh failed, keeping previous snapshot: {:#}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn starts_empty() {
        let cache = BlocklistCache::new();
        assert!(cache.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn replace_swaps_whole_snapshot() {
        let cache = BlocklistCache::new();
        let before = cache.snapshot().await;

        let mut set = HashSet::new();
        set.insert("com.example.game".to_string());
        cache.replace(set).await;

        let after = cache.snapshot().await;
        assert!(after.contains("com.example.game"));
        // The earlier snapshot is unchanged; readers holding it never see
        // a partial update.
        assert!(before.is_empty());
    }

    #[test]
    fn load_blocklist_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let set = load_blocklist(&dir.path().join("blocked_apps.json")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn load_blocklist_reads_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocked_apps.json");
        std::fs::write(&path, r#"["com.example.game","com.example.chat"]"#).unwrap();

        let set = load_blocklist(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("com.example.game"));
    }

    #[test]
    fn load_blocklist_rejects_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocked_apps.json");
        std::fs::write(&path, "{not an array}").unwrap();
        assert!(load_blocklist(&path).is_err());
    }
}
