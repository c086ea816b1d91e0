//! Unified error handling for the run-story library.
//!
//! None of these errors is fatal to a running session. The engine logs them
//! and degrades to "no update this tick"; only configuration loading returns
//! them to the caller as hard failures.

use thiserror::Error;

/// Unified error type for run-story operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoryError {
    /// Position source could not produce a sample (permission denied, no fix)
    #[error("Position source unavailable: {message}")]
    SensorUnavailable { message: String },

    /// Audio resource failed to load or play
    #[error("Playback of track '{track_id}' failed: {message}")]
    PlaybackFailure { track_id: String, message: String },

    /// No time elapsed between two samples, so no speed can be derived
    #[error("Degenerate sample at {timestamp}: no time elapsed since previous sample")]
    DegenerateSample { timestamp: u64 },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StoryError {
    /// Build a configuration error from anything displayable.
    pub fn config(message: impl Into<String>) -> Self {
        StoryError::ConfigError {
            message: message.into(),
        }
    }
}

/// Result type alias for run-story operations.
pub type Result<T> = std::result::Result<T, StoryError>;

/// Extension trait for converting Option to StoryError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| StoryError::config(message))
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| StoryError::Internal {
            message: message.to_string(),
        })
    }
}
