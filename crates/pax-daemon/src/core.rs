/// SessionController: single-owner event loop for the listening session.
///
/// Every input (client commands, the reconcile tick, sleep timer expiry,
/// alarm delivery, catalog loads, favorites snapshots) arrives as a
/// `DaemonEvent` on one mpsc channel.  The controller owns the current
/// station, the play state and the engine exclusively; no other task touches
/// them.  After each change it writes the snapshot into `StateManager` and
/// broadcasts `BroadcastMessage::StateUpdated`.
///
/// The engine is never trusted to report transitions.  A fixed-interval tick
/// polls `is_playing()` and folds the answer back into the play state.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pax_proto::catalog::{self, apply_favorites, flatten, group_stations};
use pax_proto::config::Config;
use pax_proto::error::PlaybackError;
use pax_proto::favorites::{FavoriteIds, FavoritesStore};
use pax_proto::protocol::{AlarmSetting, CatalogEntry, Command, PlaybackState, Station};
use pax_proto::state::StateManager;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alarm::{next_occurrence, AlarmBridge, AlarmPayload};
use crate::engine::PlaybackEngine;
use crate::sleep_timer::SleepTimer;
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the SessionController loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Reconciliation poll.
    ReconcileTick,
    SleepTimerExpired { generation: u64 },
    AlarmFired(AlarmPayload),
    /// Result of a background catalog load.  Only the latest request counts.
    CatalogLoaded { generation: u64, stations: Vec<Station> },
    FavoritesChanged(FavoriteIds),
    Shutdown,
}

// ── SessionController ─────────────────────────────────────────────────────────

pub struct SessionController<E: PlaybackEngine> {
    config: Config,
    state_manager: Arc<StateManager>,
    favorites: Arc<FavoritesStore>,
    engine: E,
    alarm: Box<dyn AlarmBridge>,
    sleep_timer: SleepTimer,
    sleep_generation: u64,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    poll_handle: Option<JoinHandle<()>>,
    favorites_forwarder: Option<JoinHandle<()>>,
    /// Grouped catalog in load order, before favorites are applied.
    base_catalog: Vec<CatalogEntry>,
    /// What clients see: `base_catalog` annotated and favorites-first.
    catalog: Vec<CatalogEntry>,
    favorite_ids: FavoriteIds,
    current: Option<Station>,
    playback: PlaybackState,
    volume: f32,
    track_title: Option<String>,
    /// Whether the engine holds `current`'s stream (resume is meaningful).
    engine_loaded: bool,
    catalog_generation: u64,
    /// Last-played id waiting for the first catalog.
    pending_restore: Option<String>,
    last_user_transition: Option<Instant>,
    /// Start of the connect window after a select or resume.
    selected_at: Option<Instant>,
}

impl<E: PlaybackEngine> SessionController<E> {
    pub async fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        favorites: Arc<FavoritesStore>,
        engine: E,
        alarm: Box<dyn AlarmBridge>,
        event_tx: mpsc::Sender<DaemonEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let volume = state_manager.get_state().await.volume;
        let pending_restore = state_manager.persisted().await.last_station_id;
        let favorite_ids = favorites.snapshot();

        Self {
            config,
            state_manager,
            favorites,
            engine,
            alarm,
            sleep_timer: SleepTimer::new(),
            sleep_generation: 0,
            event_tx,
            broadcast_tx,
            poll_handle: None,
            favorites_forwarder: None,
            base_catalog: Vec::new(),
            catalog: Vec::new(),
            favorite_ids,
            current: None,
            playback: PlaybackState::Idle,
            volume,
            track_title: None,
            engine_loaded: false,
            catalog_generation: 0,
            pending_restore,
            last_user_transition: None,
            selected_at: None,
        }
    }

    /// Run the event loop.  Returns on `Shutdown` or when every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("SessionController: starting event loop");
        self.start_background_tasks().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("SessionController: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("SessionController: shutdown requested");
                    break;
                }
                Some(evt) => self.handle_event(evt).await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn start_background_tasks(&mut self) {
        self.engine.set_volume(self.volume).await;

        let tick_tx = self.event_tx.clone();
        let period = self.poll_interval();
        self.poll_handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tick_tx.send(DaemonEvent::ReconcileTick).await.is_err() {
                    break;
                }
            }
        }));

        let mut favorites_rx = self.favorites.observe();
        let fav_tx = self.event_tx.clone();
        self.favorites_forwarder = Some(tokio::spawn(async move {
            while favorites_rx.changed().await.is_ok() {
                let ids = favorites_rx.borrow_and_update().clone();
                if fav_tx.send(DaemonEvent::FavoritesChanged(ids)).await.is_err() {
                    break;
                }
            }
        }));

        self.request_catalog_load();
        self.reschedule_alarm().await;
    }

    async fn cleanup(&mut self) {
        info!("SessionController: cleaning up");
        if let Some(h) = self.poll_handle.take() {
            h.abort();
        }
        if let Some(h) = self.favorites_forwarder.take() {
            h.abort();
        }
        self.sleep_timer.cancel();
        self.alarm.cancel();
        self.engine.stop().await;
        self.engine.shutdown().await;
    }

    async fn handle_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::ClientCommand(cmd) => {
                info!("SessionController: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            DaemonEvent::ReconcileTick => self.reconcile().await,
            DaemonEvent::SleepTimerExpired { generation } => {
                self.on_sleep_timer_expired(generation).await;
            }
            DaemonEvent::AlarmFired(payload) => self.on_alarm_fired(payload).await,
            DaemonEvent::CatalogLoaded {
                generation,
                stations,
            } => {
                if generation != self.catalog_generation {
                    debug!(
                        "catalog: dropping stale load {} (latest {})",
                        generation, self.catalog_generation
                    );
                } else {
                    self.install_catalog(stations).await;
                }
            }
            DaemonEvent::FavoritesChanged(ids) => self.on_favorites_changed(ids).await,
            DaemonEvent::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        if matches!(
            cmd,
            Command::Select { .. }
                | Command::Toggle
                | Command::Stop
                | Command::Next
                | Command::Prev
                | Command::Random
        ) {
            self.last_user_transition = Some(Instant::now());
        }

        match cmd {
            Command::Select { station_id } => {
                let found = self.find_station(&station_id);
                match found {
                    Some(station) => self.select(station).await,
                    None => {
                        warn!("select: unknown station {}", station_id);
                        self.toast("Station not found");
                    }
                }
            }
            Command::Toggle => self.toggle().await,
            Command::Stop => self.stop().await,
            Command::Next => self.step(1).await,
            Command::Prev => self.step(-1).await,
            Command::Random => self.select_random().await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::SleepTimer { duration_ms } => self.set_sleep_timer(duration_ms).await,
            Command::ToggleFavorite { station_id } => self.toggle_favorite(station_id),
            Command::ToggleGroup { group_id } => self.toggle_group(&group_id).await,
            Command::SetAlarm {
                hour,
                minute,
                station_id,
            } => self.set_alarm(hour, minute, &station_id).await,
            Command::CancelAlarm => self.cancel_alarm().await,
            Command::ReloadCatalog => self.request_catalog_load(),
            Command::GetState => self.notify(),
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    async fn select(&mut self, station: Station) {
        if !station.is_valid_url() {
            let err = PlaybackError::InvalidStreamUrl {
                name: station.name.clone(),
            };
            warn!("select: {}", err);
            self.set_playback(PlaybackState::NoStream).await;
            self.toast(err.to_string());
            return;
        }

        self.engine.stop().await;
        self.engine_loaded = false;
        self.clear_track_title().await;

        if self.engine.play_stream(&station.id, &station.stream_url).await {
            info!("select: playing {} ({})", station.name, station.id);
            self.engine_loaded = true;
            self.selected_at = Some(Instant::now());
            let id = station.id.clone();
            self.transition(Some(station), PlaybackState::Playing).await;
            if let Err(e) = self.state_manager.remember_last_played(&id).await {
                warn!("state: could not persist last station: {}", e);
            }
        } else {
            let err = PlaybackError::EngineFailure {
                name: station.name.clone(),
            };
            warn!("select: {}", err);
            self.selected_at = None;
            self.transition(Some(station), PlaybackState::Error).await;
            self.toast(err.to_string());
        }
    }

    async fn toggle(&mut self) {
        match self.playback {
            PlaybackState::Playing | PlaybackState::Buffering => {
                self.engine.pause().await;
                self.selected_at = None;
                self.set_playback(PlaybackState::Paused).await;
            }
            PlaybackState::Paused | PlaybackState::Idle => match self.current.clone() {
                None => self.toast("Please select a station first"),
                Some(station) if !station.is_valid_url() => {
                    self.set_playback(PlaybackState::NoStream).await;
                    self.toast("No stream URL available");
                }
                Some(station) if self.playback == PlaybackState::Idle && !self.engine_loaded => {
                    self.select(station).await;
                }
                Some(_) => {
                    self.engine.resume().await;
                    self.selected_at = Some(Instant::now());
                    self.set_playback(PlaybackState::Playing).await;
                }
            },
            PlaybackState::NoStream => self.toast("No stream URL available"),
            PlaybackState::Error => match self.current.clone() {
                Some(station) => self.select(station).await,
                None => self.toast("Please select a station first"),
            },
        }
    }

    async fn stop(&mut self) {
        self.engine.stop().await;
        self.engine_loaded = false;
        self.selected_at = None;
        self.clear_track_title().await;
        self.set_playback(PlaybackState::Idle).await;
    }

    /// Move `delta` places through the flattened catalog, wrapping.
    async fn step(&mut self, delta: isize) {
        let Some(target) = self.neighbour(delta) else {
            debug!("step: nothing to move to");
            return;
        };
        self.select(target).await;
    }

    fn neighbour(&self, delta: isize) -> Option<Station> {
        let flat = flatten(&self.catalog);
        if flat.len() < 2 {
            return None;
        }
        let current = self.current.as_ref()?;
        let idx = flat.iter().position(|s| s.id == current.id)?;
        let len = flat.len() as isize;
        let next = (idx as isize + delta).rem_euclid(len) as usize;
        Some(flat[next].clone())
    }

    async fn select_random(&mut self) {
        let current_id = self.current.as_ref().map(|s| s.id.clone());
        let valid: Vec<&Station> = flatten(&self.catalog)
            .into_iter()
            .filter(|s| s.is_valid_url())
            .collect();
        let candidates: Vec<&Station> = if valid.len() > 1 {
            valid
                .into_iter()
                .filter(|s| Some(&s.id) != current_id.as_ref())
                .collect()
        } else {
            valid
        };

        let pick = candidates.choose(&mut rand::thread_rng()).map(|s| (*s).clone());
        match pick {
            Some(station) => self.select(station).await,
            None => self.toast("No stations available"),
        }
    }

    // ── settings ──────────────────────────────────────────────────────────────

    async fn set_volume(&mut self, value: f32) {
        if !value.is_finite() {
            warn!("volume: ignoring {}", value);
            return;
        }
        let volume = value.clamp(0.0, 1.0);
        if volume == self.volume {
            return;
        }
        self.volume = volume;
        self.engine.set_volume(volume).await;
        if let Err(e) = self.state_manager.set_volume(volume).await {
            warn!("state: could not persist volume: {}", e);
        }
        self.notify();
    }

    async fn set_sleep_timer(&mut self, duration_ms: u64) {
        self.sleep_generation += 1;
        if duration_ms == 0 {
            info!("sleep timer: canceled");
            self.sleep_timer.cancel();
        } else {
            info!("sleep timer: {} ms", duration_ms);
            let generation = self.sleep_generation;
            let tx = self.event_tx.clone();
            self.sleep_timer
                .start(Duration::from_millis(duration_ms), move || {
                    tokio::spawn(async move {
                        let _ = tx.send(DaemonEvent::SleepTimerExpired { generation }).await;
                    });
                });
        }
        self.publish_sleep_timer().await;
    }

    async fn on_sleep_timer_expired(&mut self, generation: u64) {
        if generation != self.sleep_generation {
            debug!("sleep timer: ignoring stale expiry {}", generation);
            return;
        }
        info!("sleep timer: expired, stopping playback");
        self.last_user_transition = Some(Instant::now());
        self.engine.stop().await;
        self.engine_loaded = false;
        self.selected_at = None;
        self.transition(None, PlaybackState::Idle).await;
        self.publish_sleep_timer().await;
    }

    async fn publish_sleep_timer(&mut self) {
        self.state_manager
            .set_sleep_timer(self.sleep_timer.status())
            .await;
        self.notify();
    }

    // ── catalog & favorites ───────────────────────────────────────────────────

    fn toggle_favorite(&mut self, station_id: String) {
        let store = Arc::clone(&self.favorites);
        tokio::spawn(async move {
            if let Err(e) = store.toggle(&station_id).await {
                warn!("favorites: toggle {} failed: {}", station_id, e);
            }
        });
    }

    async fn on_favorites_changed(&mut self, ids: FavoriteIds) {
        debug!("favorites: {} ids", ids.len());
        self.favorite_ids = ids;
        self.rebuild_catalog().await;
        self.refresh_current().await;
    }

    async fn toggle_group(&mut self, group_id: &str) {
        let group = self.base_catalog.iter_mut().find_map(|entry| match entry {
            CatalogEntry::Group(g) if g.id == group_id => Some(g),
            _ => None,
        });
        match group {
            Some(g) => g.expanded = !g.expanded,
            None => {
                debug!("toggle_group: unknown group {}", group_id);
                return;
            }
        }
        self.rebuild_catalog().await;
    }

    fn request_catalog_load(&mut self) {
        self.catalog_generation += 1;
        let generation = self.catalog_generation;
        let path = self.config.catalog.path.clone();
        let logo_dir = self.config.catalog.logo_dir.clone();
        let tx = self.event_tx.clone();
        debug!("catalog: load {} from {}", generation, path.display());

        tokio::spawn(async move {
            let loaded = tokio::task::spawn_blocking(move || {
                catalog::load_catalog_or_fallback(&path, &logo_dir)
            })
            .await;
            let stations = match loaded {
                Ok(stations) => stations,
                Err(e) => {
                    error!("catalog: loader task failed: {}", e);
                    catalog::fallback_stations()
                }
            };
            let _ = tx
                .send(DaemonEvent::CatalogLoaded {
                    generation,
                    stations,
                })
                .await;
        });
    }

    async fn install_catalog(&mut self, stations: Vec<Station>) {
        let expanded: HashMap<String, bool> = self
            .base_catalog
            .iter()
            .filter_map(|entry| match entry {
                CatalogEntry::Group(g) => Some((g.id.clone(), g.expanded)),
                CatalogEntry::Station(_) => None,
            })
            .collect();

        let mut entries = group_stations(stations);
        for entry in &mut entries {
            if let CatalogEntry::Group(g) = entry {
                if let Some(&was_expanded) = expanded.get(&g.id) {
                    g.expanded = was_expanded;
                }
            }
        }
        info!("catalog: {} entries", entries.len());
        self.base_catalog = entries;
        self.rebuild_catalog().await;

        let restore = self.pending_restore.take().filter(|_| self.current.is_none());
        let Some(id) = restore else {
            self.refresh_current().await;
            return;
        };
        let found = self.find_station(&id);
        match found {
            Some(station) => {
                info!("session: restored {} ({})", station.name, station.id);
                self.transition(Some(station), PlaybackState::Idle).await;
            }
            None => debug!("session: last station {} no longer listed", id),
        }
    }

    async fn rebuild_catalog(&mut self) {
        self.catalog = apply_favorites(&self.base_catalog, &self.favorite_ids);
        self.state_manager.set_catalog(self.catalog.clone()).await;
        self.notify();
    }

    /// Replace `current` with its copy from the catalog (favorite flag etc.).
    async fn refresh_current(&mut self) {
        let Some(id) = self.current.as_ref().map(|s| s.id.clone()) else {
            return;
        };
        let Some(fresh) = self.find_station(&id) else {
            return;
        };
        if self.current.as_ref() != Some(&fresh) {
            self.current = Some(fresh);
            self.state_manager.refresh_current(self.current.clone()).await;
            self.notify();
        }
    }

    fn find_station(&self, id: &str) -> Option<Station> {
        flatten(&self.catalog)
            .into_iter()
            .find(|s| s.id == id)
            .cloned()
    }

    // ── alarm ─────────────────────────────────────────────────────────────────

    async fn set_alarm(&mut self, hour: u32, minute: u32, station_id: &str) {
        let Some(station) = self.find_station(station_id) else {
            warn!("alarm: unknown station {}", station_id);
            self.toast("Station not found");
            return;
        };
        let Some(when) = next_occurrence(hour, minute, &chrono::Local::now()) else {
            warn!("alarm: invalid time {}:{}", hour, minute);
            self.toast("Invalid alarm time");
            return;
        };
        let fires_at = when.timestamp_millis();
        info!("alarm: {} at {}", station.id, when);

        self.alarm
            .schedule_one_shot(fires_at, AlarmPayload::for_station(&station));
        self.persist_alarm(Some(AlarmSetting {
            hour,
            minute,
            station_id: station.id,
            station_name: station.name,
            stream_url: station.stream_url,
            fires_at_epoch_ms: Some(fires_at),
        }))
        .await;
        self.notify();
        self.toast(format!("Alarm set for {:02}:{:02}", hour, minute));
    }

    async fn cancel_alarm(&mut self) {
        self.alarm.cancel();
        self.persist_alarm(None).await;
        self.notify();
        self.toast("Alarm canceled");
    }

    /// Re-arm a persisted alarm for its next occurrence.
    async fn reschedule_alarm(&mut self) {
        let Some(setting) = self.state_manager.persisted().await.alarm else {
            return;
        };
        match next_occurrence(setting.hour, setting.minute, &chrono::Local::now()) {
            Some(when) => {
                let fires_at = when.timestamp_millis();
                info!("alarm: restored for {}", when);
                self.alarm
                    .schedule_one_shot(fires_at, AlarmPayload::from(&setting));
                self.persist_alarm(Some(AlarmSetting {
                    fires_at_epoch_ms: Some(fires_at),
                    ..setting
                }))
                .await;
            }
            None => self.persist_alarm(None).await,
        }
        self.notify();
    }

    async fn on_alarm_fired(&mut self, payload: AlarmPayload) {
        info!("alarm: fired for {}", payload.station_id);
        self.last_user_transition = Some(Instant::now());
        let station = self.alarm_station(&payload);
        match station {
            Some(station) => self.select(station).await,
            None => self.toast("Alarm station is no longer available"),
        }
        self.persist_alarm(None).await;
        self.notify();
    }

    /// The catalog entry streaming the alarm's URL, else the station as it
    /// was when the alarm was set.  Settings without a URL match by id.
    fn alarm_station(&self, payload: &AlarmPayload) -> Option<Station> {
        if payload.stream_url.is_empty() {
            return self.find_station(&payload.station_id);
        }
        let listed = flatten(&self.catalog)
            .into_iter()
            .find(|s| s.stream_url == payload.stream_url)
            .cloned();
        listed.or_else(|| {
            let station = Station::new(
                payload.station_id.clone(),
                payload.station_name.clone(),
                payload.stream_url.clone(),
                "",
            );
            station.is_valid_url().then_some(station)
        })
    }

    async fn persist_alarm(&self, alarm: Option<AlarmSetting>) {
        if let Err(e) = self.state_manager.set_alarm(alarm).await {
            warn!("state: could not persist alarm: {}", e);
        }
    }

    // ── reconciliation ────────────────────────────────────────────────────────

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.session.poll_interval_ms.max(100))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session.connect_timeout_secs)
    }

    /// Fold the engine's audibility into the play state.  Only queries the
    /// engine; transport calls here would feed back into the next tick.
    async fn reconcile(&mut self) {
        let now = Instant::now();
        let audible = self.engine.is_playing().await;

        let title = self.engine.current_track_title().await;
        if title != self.track_title {
            debug!("reconcile: track title {:?}", title);
            self.track_title = title.clone();
            self.state_manager.set_track_title(title).await;
            self.notify();
        }

        if self.sleep_timer.is_active() {
            self.publish_sleep_timer().await;
        }

        if let Some(at) = self.last_user_transition {
            if now.duration_since(at) < self.poll_interval() {
                return;
            }
        }

        match (audible, self.playback) {
            (true, PlaybackState::Playing) => self.selected_at = None,
            (true, _) => {
                let current = match &self.current {
                    Some(s) => Some(s.clone()),
                    None => self
                        .engine
                        .current_stream_id()
                        .and_then(|id| self.find_station(&id)),
                };
                info!("reconcile: engine audible, {:?} -> Playing", self.playback);
                self.selected_at = None;
                self.engine_loaded = true;
                self.transition(current, PlaybackState::Playing).await;
            }
            (false, PlaybackState::Playing) => {
                let connecting = self
                    .selected_at
                    .is_some_and(|at| now.duration_since(at) < self.connect_timeout());
                let next = if connecting {
                    PlaybackState::Buffering
                } else {
                    PlaybackState::Paused
                };
                info!("reconcile: engine silent, Playing -> {:?}", next);
                self.set_playback(next).await;
            }
            (false, PlaybackState::Buffering) => {
                let timed_out = self
                    .selected_at
                    .map_or(true, |at| now.duration_since(at) >= self.connect_timeout());
                if timed_out {
                    let name = self
                        .current
                        .as_ref()
                        .map(|s| s.name.clone())
                        .unwrap_or_default();
                    let err = PlaybackError::EngineFailure { name };
                    warn!("reconcile: connect timeout: {}", err);
                    self.selected_at = None;
                    self.set_playback(PlaybackState::Error).await;
                    self.toast(err.to_string());
                }
            }
            (false, _) => {}
        }
    }

    // ── publishing ────────────────────────────────────────────────────────────

    async fn transition(&mut self, current: Option<Station>, playback: PlaybackState) {
        debug!("playback: {:?} -> {:?}", self.playback, playback);
        self.current = current;
        self.playback = playback;
        if self.current.is_none() {
            self.track_title = None;
        }
        self.state_manager
            .set_now_playing(self.current.clone(), playback)
            .await;
        self.notify();
    }

    async fn set_playback(&mut self, playback: PlaybackState) {
        debug!("playback: {:?} -> {:?}", self.playback, playback);
        self.playback = playback;
        self.state_manager.set_playback(playback).await;
        self.notify();
    }

    async fn clear_track_title(&mut self) {
        if self.track_title.take().is_some() {
            self.state_manager.set_track_title(None).await;
        }
    }

    fn notify(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    fn toast(&self, message: impl Into<String>) {
        let message = message.into();
        info!("toast: {}", message);
        let _ = self.broadcast_tx.send(BroadcastMessage::Toast(message));
    }
}

impl<E: PlaybackEngine> Drop for SessionController<E> {
    fn drop(&mut self) {
        if let Some(h) = self.poll_handle.take() {
            h.abort();
        }
        if let Some(h) = self.favorites_forwarder.take() {
            h.abort();
        }
    }
}
