use crate::protocol::{
    AlarmSetting, CatalogEntry, PlaybackState, SessionState, SleepTimerStatus, Station,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The part of the session that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    #[serde(default)]
    pub last_station_id: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub alarm: Option<AlarmSetting>,
}

fn default_volume() -> f32 {
    0.5
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_station_id: None,
            volume: default_volume(),
            alarm: None,
        }
    }
}

/// Holder of the published `SessionState`.  Every setter replaces fields under
/// one write lock and bumps `rev`, so readers never see a half-applied change.
/// Only the session controller calls the setters.
pub struct StateManager {
    state: Arc<RwLock<SessionState>>,
    persistent: RwLock<PersistentState>,
    state_file: PathBuf,
}

impl StateManager {
    /// `default_volume` applies only when no saved state exists yet.
    pub fn new(state_file: PathBuf, default_volume: f32) -> Self {
        let persistent = Self::load_persistent(&state_file).unwrap_or(PersistentState {
            volume: default_volume.clamp(0.0, 1.0),
            ..PersistentState::default()
        });

        let state = SessionState {
            rev: 1,
            volume: persistent.volume,
            alarm: persistent.alarm.clone(),
            ..SessionState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            persistent: RwLock::new(persistent),
            state_file,
        }
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn persisted(&self) -> PersistentState {
        self.persistent.read().await.clone()
    }

    pub async fn set_catalog(&self, catalog: Vec<CatalogEntry>) {
        let mut state = self.state.write().await;
        state.catalog = catalog;
        state.rev += 1;
    }

    /// Replace current station and playback state together.
    pub async fn set_now_playing(&self, current: Option<Station>, playback: PlaybackState) {
        let mut state = self.state.write().await;
        state.current = current;
        state.playback = playback;
        if state.current.is_none() {
            state.track_title = None;
        }
        state.rev += 1;
    }

    /// Record `station_id` for session restoration on next start.
    pub async fn remember_last_played(&self, station_id: &str) -> anyhow::Result<()> {
        let id = station_id.to_string();
        self.update_persistent(|p| p.last_station_id = Some(id)).await
    }

    /// Refresh the current station's value (e.g. favorite flag) without
    /// touching playback or persistence.
    pub async fn refresh_current(&self, current: Option<Station>) {
        let mut state = self.state.write().await;
        state.current = current;
        state.rev += 1;
    }

    pub async fn set_playback(&self, playback: PlaybackState) {
        let mut state = self.state.write().await;
        state.playback = playback;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        {
            let mut state = self.state.write().await;
            state.volume = volume;
            state.rev += 1;
        }
        self.update_persistent(|p| p.volume = volume).await
    }

    pub async fn set_track_title(&self, title: Option<String>) {
        let mut state = self.state.write().await;
        state.track_title = title;
        state.rev += 1;
    }

    pub async fn set_sleep_timer(&self, status: SleepTimerStatus) {
        let mut state = self.state.write().await;
        state.sleep_timer = status;
        state.rev += 1;
    }

    pub async fn set_alarm(&self, alarm: Option<AlarmSetting>) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.alarm = alarm.clone();
            state.rev += 1;
        }
        self.update_persistent(|p| p.alarm = alarm).await
    }

    async fn update_persistent(&self, f: impl FnOnce(&mut PersistentState)) -> anyhow::Result<()> {
        let snapshot = {
            let mut persistent = self.persistent.write().await;
            let before = persistent.clone();
            f(&mut persistent);
            if *persistent == before {
                return Ok(());
            }
            persistent.clone()
        };
        self.save(&snapshot).await
    }

    async fn save(&self, persistent: &PersistentState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> Option<PersistentState> {
        let content = std::fs::read_to_string(state_file).ok()?;
        serde_json::from_str::<PersistentState>(&content).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_played_and_volume_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let sm = StateManager::new(path.clone(), 0.5);
            let station = Station::new("station_4", "Jazz", "https://jazz", "");
            sm.set_now_playing(Some(station), PlaybackState::Playing).await;
            sm.remember_last_played("station_4").await.unwrap();
            sm.set_volume(1.7).await.unwrap();
            assert_eq!(sm.get_state().await.volume, 1.0);
        }

        let sm = StateManager::new(path, 0.3);
        let persisted = sm.persisted().await;
        assert_eq!(persisted.last_station_id.as_deref(), Some("station_4"));
        assert_eq!(persisted.volume, 1.0);
        let state = sm.get_state().await;
        assert_eq!(state.volume, 1.0);
        assert!(state.current.is_none());
        assert_eq!(state.playback, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn test_rev_increments_and_clearing_keeps_last_played() {
        let dir = tempfile::tempdir().unwrap();
        let sm = StateManager::new(dir.path().join("state.json"), 0.5);
        let rev0 = sm.get_state().await.rev;

        let station = Station::new("a", "A", "https://a", "");
        sm.set_now_playing(Some(station), PlaybackState::Playing).await;
        sm.remember_last_played("a").await.unwrap();
        sm.set_track_title(Some("Song".into())).await;
        sm.set_now_playing(None, PlaybackState::Idle).await;

        let state = sm.get_state().await;
        assert_eq!(state.rev, rev0 + 3);
        assert!(state.track_title.is_none());
        assert_eq!(sm.persisted().await.last_station_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_corrupt_state_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let sm = StateManager::new(path, 0.8);
        let persisted = sm.persisted().await;
        assert!(persisted.last_station_id.is_none());
        assert_eq!(persisted.volume, 0.8);
    }
}
