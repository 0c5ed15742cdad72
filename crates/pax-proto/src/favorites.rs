//! Persisted set of favorite station ids.
//!
//! Stored as `favorites.toml` (`ids = ["station_0", ...]`).  Every change is
//! written to disk first and then published as a fresh snapshot on a
//! `tokio::sync::watch` channel; observers always see whole sets.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

pub type FavoriteIds = BTreeSet<String>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct FavoritesFile {
    #[serde(default)]
    ids: FavoriteIds,
}

pub struct FavoritesStore {
    path: PathBuf,
    /// Serialises toggles so two writers can't interleave file writes.
    ids: Mutex<FavoriteIds>,
    tx: watch::Sender<FavoriteIds>,
}

impl FavoritesStore {
    /// Open the store at `path`.  A missing file is an empty set; an unreadable
    /// one is logged and treated as empty (it is overwritten on next toggle).
    pub fn load(path: PathBuf) -> Self {
        let ids = Self::read_file(&path);
        let (tx, _) = watch::channel(ids.clone());
        Self {
            path,
            ids: Mutex::new(ids),
            tx,
        }
    }

    /// Receiver of favorites snapshots; the current set is available
    /// immediately via `borrow()`.
    pub fn observe(&self) -> watch::Receiver<FavoriteIds> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> FavoriteIds {
        self.tx.borrow().clone()
    }

    /// Flip membership of `station_id`.  Returns whether it is now a favorite.
    pub async fn toggle(&self, station_id: &str) -> anyhow::Result<bool> {
        let mut ids = self.ids.lock().await;
        let mut next = ids.clone();
        let now_favorite = if next.remove(station_id) {
            false
        } else {
            next.insert(station_id.to_string());
            true
        };

        self.save(&next).await?;
        debug!("favorites: {} -> {}", station_id, now_favorite);
        *ids = next.clone();
        self.tx.send_replace(next);
        Ok(now_favorite)
    }

    async fn save(&self, ids: &FavoriteIds) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&FavoritesFile { ids: ids.clone() })?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    fn read_file(path: &Path) -> FavoriteIds {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return FavoriteIds::new(),
        };
        match toml::from_str::<FavoritesFile>(&content) {
            Ok(file) => file.ids,
            Err(e) => {
                warn!("favorites: ignoring unreadable {}: {}", path.display(), e);
                FavoriteIds::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toggle_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FavoritesStore::load(dir.path().join("favorites.toml"));
        let mut rx = store.observe();
        assert!(rx.borrow().is_empty());

        assert!(store.toggle("station_1").await.unwrap());
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains("station_1"));

        assert!(!store.toggle("station_1").await.unwrap());
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().contains("station_1"));
    }

    #[tokio::test]
    async fn test_favorites_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("favorites.toml");
        {
            let store = FavoritesStore::load(path.clone());
            store.toggle("a").await.unwrap();
            store.toggle("b").await.unwrap();
        }
        let store = FavoritesStore::load(path);
        let ids: Vec<String> = store.snapshot().into_iter().collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("favorites.toml");
        std::fs::write(&path, "ids = not-a-list").unwrap();
        let store = FavoritesStore::load(path);
        assert!(store.snapshot().is_empty());
    }
}
