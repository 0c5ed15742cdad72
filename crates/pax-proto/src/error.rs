use thiserror::Error;

/// Failures a listener can see during a session.  None of them is fatal and
/// none is retried automatically; recovery is always a user action.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Stream not available for {name}")]
    InvalidStreamUrl { name: String },

    #[error("Failed to play {name}")]
    EngineFailure { name: String },

    /// Recovered locally with the built-in station list.
    #[error("Station list unavailable: {0}")]
    ResourceLoadFailure(String),
}
