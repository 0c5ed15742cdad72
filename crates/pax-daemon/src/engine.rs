//! Transport surface the session controller drives.
//!
//! The controller only ever sees a boolean "is something audible" signal; it
//! does not subscribe to engine events.  State is reconciled by polling (see
//! `core::SessionController::reconcile`).

use std::future::Future;

pub trait PlaybackEngine: Send + 'static {
    /// Load and start `url`, tagging it with station `id`.  `false` when the
    /// stream could not be opened.
    fn play_stream(&mut self, id: &str, url: &str) -> impl Future<Output = bool> + Send;

    fn pause(&mut self) -> impl Future<Output = ()> + Send;

    fn resume(&mut self) -> impl Future<Output = ()> + Send;

    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    fn is_playing(&mut self) -> impl Future<Output = bool> + Send;

    /// `volume` is already clamped to 0.0..=1.0.
    fn set_volume(&mut self, volume: f32) -> impl Future<Output = ()> + Send;

    fn current_track_title(&mut self) -> impl Future<Output = Option<String>> + Send;

    /// Id passed to the last successful `play_stream`, while still loaded.
    fn current_stream_id(&self) -> Option<String>;

    /// Release the underlying player.  Called once when the session ends.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
