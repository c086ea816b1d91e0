//! # Run Story
//!
//! Speed-driven audio narrative engine for running stories.
//!
//! This library provides:
//! - A short-displacement distance estimator and speed bookkeeping for
//!   noisy, irregularly-timed GPS samples
//! - A narrative state machine that advances scripted audio segments on
//!   wall-clock timers and gates the final chase on average speed
//! - Volume curves that turn instantaneous speed into effort feedback
//! - A tokio session runner that multiplexes position, timer and audio events
//!
//! ## Quick Start
//!
//! ```rust
//! use run_story::{RecordingPlayer, Segment, StoryConfig, StoryEngine};
//!
//! let player = RecordingPlayer::new();
//! let mut engine = StoryEngine::new(StoryConfig::default(), player.clone()).unwrap();
//!
//! engine.start(0);
//! assert_eq!(engine.snapshot().segment, Some(Segment::Intro));
//! assert_eq!(player.log().current_track.as_deref(), Some("a"));
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, StoryError};

// Distance and speed estimation
pub mod estimator;
pub use estimator::{
    average_speed, distance, instantaneous_speed, SpeedEstimator, SpeedHistory, SpeedSample,
    SpeedUpdate,
};

// Speed to volume mapping
pub mod volume;
pub use volume::VolumePolicy;

// Segment table and session configuration
pub mod config;
pub use config::{
    AdvancePolicy, SegmentConfig, SegmentTable, SpeedGate, StoryConfig, TrackCatalog, VolumeMode,
};

// Narrative state machine (no I/O, emits effects)
pub mod machine;
pub use machine::{Effect, FeedHandle, PlaybackState, StoryMachine, TimerHandle};

// Audio playback seam
pub mod audio;
pub use audio::{AudioEvent, AudioLog, AudioPlayer, RecordingPlayer};

// Engine applying machine effects to a player
pub mod engine;
pub use engine::{ErrorCallback, PendingTimer, StoryEngine, StorySnapshot};

// Position sources
pub mod feed;
pub use feed::{PollingFeed, PositionReading, PositionSampler, PositionSource};

// Async session loop
pub mod runner;
pub use runner::{SessionClock, StoryRunner};

// ============================================================================
// Core Types
// ============================================================================

/// A single location sample.
///
/// # Example
/// ```
/// use run_story::Coordinate;
/// let point = Coordinate::new(35.6812, 139.7671); // Tokyo Station
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the coordinate is finite and within geographic range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One phase of the scripted narrative.
///
/// `Build2` is the speed-gated segment: its exit depends on the measured
/// average speed when its timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Intro,
    Build1,
    Build2,
    Success,
    Failure,
}

impl Segment {
    /// Every segment, in narrative order.
    pub const ALL: [Segment; 5] = [
        Segment::Intro,
        Segment::Build1,
        Segment::Build2,
        Segment::Success,
        Segment::Failure,
    ];

    /// Position of this segment in [`Segment::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Segment::Intro => 0,
            Segment::Build1 => 1,
            Segment::Build2 => 2,
            Segment::Success => 3,
            Segment::Failure => 4,
        }
    }

    /// Short label used by the bundled track names ("a" through "e").
    pub fn label(&self) -> &'static str {
        match self {
            Segment::Intro => "a",
            Segment::Build1 => "b",
            Segment::Build2 => "c",
            Segment::Success => "d",
            Segment::Failure => "e",
        }
    }

    /// The outcome this segment represents, if it is terminal.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Segment::Success => Some(Outcome::Success),
            Segment::Failure => Some(Outcome::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }
}

/// Terminal outcome of a session, routed by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

// ============================================================================
// Tests
// ============================================================================
