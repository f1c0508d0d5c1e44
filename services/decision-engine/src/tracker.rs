//! Position tracker - durable high-water marks per deal
//!
//! The tracker is the only owner of the max-profit ledger. It lives in memory
//! for the whole run and is flushed to a [`TrackerStore`] after every tick
//! that changed it. A missing or unreadable store starts the run empty.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Persisted entry for one deal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub max_profit: f64,
}

pub type TrackerMap = BTreeMap<String, TrackerEntry>;

/// Narrow key-value store behind the tracker
#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Load stored entries; `None` when nothing has been stored yet
    async fn load(&self) -> Result<Option<TrackerMap>, StoreError>;

    /// Replace stored entries
    async fn save(&self, entries: &TrackerMap) -> Result<(), StoreError>;

    fn describe(&self) -> String;
}

/// JSON file store, written atomically via temp file + rename
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TrackerStore for JsonFileStore {
    async fn load(&self) -> Result<Option<TrackerMap>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    async fn save(&self, entries: &TrackerMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} tracker entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store, for runs that accept losing state on exit
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Option<TrackerMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: TrackerMap) -> Self {
        Self {
            entries: Mutex::new(Some(entries)),
        }
    }

    /// Copy of the last saved entries
    pub fn snapshot(&self) -> Option<TrackerMap> {
        self.entries.lock().ok().and_then(|e| e.clone())
    }
}

#[async_trait]
impl TrackerStore for MemoryStore {
    async fn load(&self) -> Result<Option<TrackerMap>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, entries: &TrackerMap) -> Result<(), StoreError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        *guard = Some(entries.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Max-profit ledger keyed by deal id
pub struct PositionTracker {
    entries: TrackerMap,
    dirty: bool,
    store: Box<dyn TrackerStore>,
}

impl PositionTracker {
    /// Empty tracker backed by `store`, without reading it
    pub fn new(store: Box<dyn TrackerStore>) -> Self {
        Self {
            entries: TrackerMap::new(),
            dirty: false,
            store,
        }
    }

    /// Load from `store`; a missing or corrupt record starts empty
    pub async fn open(store: Box<dyn TrackerStore>) -> Self {
        let mut tracker = Self::new(store);

        match tracker.store.load().await {
            Ok(Some(entries)) => {
                info!(
                    "Loaded {} tracked positions from {}",
                    entries.len(),
                    tracker.store.describe()
                );
                tracker.entries = entries;
            }
            Ok(None) => {
                info!(
                    "No tracker state at {}, starting empty",
                    tracker.store.describe()
                );
            }
            Err(e) => {
                warn!(
                    "Could not read tracker state at {} ({}), starting empty",
                    tracker.store.describe(),
                    e
                );
            }
        }

        tracker
    }

    pub fn max_profit(&self, deal_id: &str) -> Option<f64> {
        self.entries.get(deal_id).map(|e| e.max_profit)
    }

    /// Record a profit reading and return the updated high-water mark.
    ///
    /// New entries are seeded at the reading, floored at zero. Non-finite
    /// readings never raise the mark.
    pub fn observe(&mut self, deal_id: &str, profit: f64) -> f64 {
        let reading = if profit.is_finite() { profit } else { f64::NEG_INFINITY };

        match self.entries.get_mut(deal_id) {
            Some(entry) => {
                if reading > entry.max_profit {
                    entry.max_profit = reading;
                    self.dirty = true;
                }
                entry.max_profit
            }
            None => {
                let seed = reading.max(0.0);
                self.entries
                    .insert(deal_id.to_string(), TrackerEntry { max_profit: seed });
                self.dirty = true;
                debug!("Tracking {} from {:.4}", deal_id, seed);
                seed
            }
        }
    }

    pub fn remove(&mut self, deal_id: &str) -> Option<TrackerEntry> {
        let removed = self.entries.remove(deal_id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Drop entries whose deal is no longer open; returns the dropped ids
    pub fn retain_open(&mut self, open_ids: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !open_ids.contains(*id))
            .cloned()
            .collect();

        for id in &stale {
            self.entries.remove(id);
        }
        if !stale.is_empty() {
            self.dirty = true;
        }
        stale
    }

    pub fn entries(&self) -> &TrackerMap {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flush to the store if anything changed; `Ok(true)` when written.
    ///
    /// On failure the tracker stays dirty so the next tick retries.
    pub async fn persist(&mut self) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        self.store.save(&self.entries).await?;
        self.dirty = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_peak_is_monotonic() {
        let mut tracker = PositionTracker::new(Box::new(MemoryStore::new()));

        let readings = [0.01, 0.04, 0.07, 0.05, 0.02, 0.06];
        let mut seen_max = 0.0_f64;
        for r in readings {
            seen_max = seen_max.max(r);
            let peak = tracker.observe("deal-1", r);
            assert_eq!(peak, seen_max);
        }
        assert_eq!(tracker.max_profit("deal-1"), Some(0.07));
    }

    #[test]
    fn test_new_entry_seeded_at_zero_floor() {
        let mut tracker = PositionTracker::new(Box::new(MemoryStore::new()));
        assert_eq!(tracker.observe("deal-1", -0.02), 0.0);
        assert_eq!(tracker.observe("deal-2", 0.03), 0.03);
    }

    #[test]
    fn test_non_finite_reading_ignored() {
        let mut tracker = PositionTracker::new(Box::new(MemoryStore::new()));
        tracker.observe("deal-1", 0.05);
        assert_eq!(tracker.observe("deal-1", f64::NAN), 0.05);
        assert_eq!(tracker.observe("deal-1", f64::INFINITY), 0.05);
    }

    #[test]
    fn test_retain_open_prunes_closed_deals() {
        let mut tracker = PositionTracker::new(Box::new(MemoryStore::new()));
        tracker.observe("a", 0.01);
        tracker.observe("b", 0.02);

        let open: HashSet<String> = ["b".to_string()].into_iter().collect();
        let pruned = tracker.retain_open(&open);

        assert_eq!(pruned, vec!["a".to_string()]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.max_profit("a").is_none());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("tracker.json");

        let mut tracker = PositionTracker::open(Box::new(JsonFileStore::new(&path))).await;
        assert!(tracker.is_empty());
        tracker.observe("deal-1", 0.1234567890123);
        tracker.observe("deal-2", 0.05);
        assert!(tracker.persist().await.unwrap());
        assert!(!tracker.is_dirty());

        // Nothing changed, nothing written
        assert!(!tracker.persist().await.unwrap());

        let reloaded = PositionTracker::open(Box::new(JsonFileStore::new(&path))).await;
        assert_eq!(reloaded.entries(), tracker.entries());
        assert_eq!(reloaded.max_profit("deal-1"), Some(0.1234567890123));
        assert!(!path.with_file_name("tracker.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let tracker = PositionTracker::open(Box::new(JsonFileStore::new(&path))).await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_snapshot() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut tracker = PositionTracker::new(Box::new(SharedMemory(store.clone())));
        tracker.observe("deal-1", 0.02);
        tracker.persist().await.unwrap();

        let saved = store.snapshot().unwrap();
        assert_eq!(saved.get("deal-1"), Some(&TrackerEntry { max_profit: 0.02 }));
    }

    struct SharedMemory(std::sync::Arc<MemoryStore>);

    #[async_trait]
    impl TrackerStore for SharedMemory {
        async fn load(&self) -> Result<Option<TrackerMap>, StoreError> {
            self.0.load().await
        }

        async fn save(&self, entries: &TrackerMap) -> Result<(), StoreError> {
            self.0.save(entries).await
        }

        fn describe(&self) -> String {
            self.0.describe()
        }
    }
}
