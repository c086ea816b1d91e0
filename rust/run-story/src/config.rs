//! Session configuration.
//!
//! Everything that differs between story variants lives here as data: the
//! per-segment durations, gate thresholds, volume modes and track names, plus
//! the global volume levels and speed normalization. A configuration is
//! validated once, when a machine is built from it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OptionExt;
use crate::{Result, Segment, StoryError, VolumePolicy};

/// Speed thresholds deciding where the speed-gated segment goes next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedGate {
    /// Average speed (m/min) at or above which the runner escapes.
    /// Default: 250.0
    pub success_threshold: f64,
    /// Average speed at or above which the segment is replayed instead of failed.
    /// Default: 180.0
    pub retry_threshold: f64,
    pub on_success: Segment,
    pub on_retry: Segment,
    pub on_failure: Segment,
}

impl SpeedGate {
    /// Successor for a given average speed.
    pub fn successor(&self, average_speed: f64) -> Segment {
        if average_speed >= self.success_threshold {
            self.on_success
        } else if average_speed >= self.retry_threshold {
            self.on_retry
        } else {
            self.on_failure
        }
    }
}

impl Default for SpeedGate {
    fn default() -> Self {
        Self {
            success_threshold: 250.0,
            retry_threshold: 180.0,
            on_success: Segment::Success,
            on_retry: Segment::Build2,
            on_failure: Segment::Failure,
        }
    }
}

/// How a segment decides to end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Advance to `next` after a fixed time
    Fixed { duration_ms: u64, next: Segment },
    /// After `duration_ms`, pick a successor by average speed
    SpeedGated { duration_ms: u64, gate: SpeedGate },
    /// Dwell, then end the session
    Terminal { dwell_ms: u64 },
}

impl AdvancePolicy {
    /// Time from entering the segment until its timer fires.
    pub fn duration_ms(&self) -> u64 {
        match self {
            AdvancePolicy::Fixed { duration_ms, .. }
            | AdvancePolicy::SpeedGated { duration_ms, .. } => *duration_ms,
            AdvancePolicy::Terminal { dwell_ms } => *dwell_ms,
        }
    }

    /// Whether the segment tracks position while active.
    pub fn tracks_speed(&self) -> bool {
        matches!(self, AdvancePolicy::SpeedGated { .. })
    }
}

/// Which volume a segment plays at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeMode {
    /// Fixed low level so narration sits under ambient music
    Background,
    /// Driven by instantaneous speed through the volume policy
    SpeedCurve,
    /// The user's master volume
    Master,
}

/// One row of the segment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub segment: Segment,
    pub track_id: String,
    pub advance: AdvancePolicy,
    pub volume: VolumeMode,
    /// Restart the track when the audio engine reports it ended
    #[serde(default)]
    pub loop_track: bool,
}

/// Validated segment table, indexed by [`Segment::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTable {
    rows: [SegmentConfig; 5],
}

impl SegmentTable {
    pub fn get(&self, segment: Segment) -> &SegmentConfig {
        &self.rows[segment.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentConfig> {
        self.rows.iter()
    }
}

/// Resolves track identifiers to playable resource paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCatalog {
    base: String,
    extension: String,
}

impl TrackCatalog {
    pub fn new(base: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            extension: extension.into(),
        }
    }

    /// Resource path for a track, e.g. `/assets/c.mp3`.
    pub fn resolve(&self, track_id: &str) -> String {
        let base = self.base.trim_end_matches('/');
        let extension = self.extension.trim_start_matches('.');
        if extension.is_empty() {
            format!("{}/{}", base, track_id)
        } else {
            format!("{}/{}.{}", base, track_id, extension)
        }
    }
}

/// Configuration for a story session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    /// Segment table. Must contain every segment exactly once.
    pub segments: Vec<SegmentConfig>,

    /// Volume curve for speed-driven segments.
    /// Default: extended
    pub volume_policy: VolumePolicy,

    /// Volume for background segments.
    /// Default: 0.1
    pub background_volume: f64,

    /// User master volume for segments that don't follow speed.
    /// Default: 1.0
    pub master_volume: f64,

    /// Volume set on entering a speed-curve segment, before the first measurement.
    /// Default: 0.025
    pub baseline_volume: f64,

    /// Total distance is divided by this to get the average speed.
    /// Default: 60000.0
    pub average_speed_divisor: f64,

    /// Keep at most this many speed samples (None = unbounded).
    /// Capping does not change the average.
    pub history_capacity: Option<usize>,

    /// Period of the polling position feed.
    /// Default: 5000 ms
    pub poll_interval_ms: u64,

    /// Base path that track files are resolved against.
    /// Default: "/"
    pub asset_base: String,

    /// Track file extension.
    /// Default: "mp3"
    pub track_extension: String,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            segments: default_segments(),
            volume_policy: VolumePolicy::default(),
            background_volume: 0.1,
            master_volume: 1.0,
            baseline_volume: 0.025,
            average_speed_divisor: 60_000.0,
            history_capacity: None,
            poll_interval_ms: 5000,
            asset_base: "/".to_string(),
            track_extension: "mp3".to_string(),
        }
    }
}

fn default_segments() -> Vec<SegmentConfig> {
    let row = |segment: Segment, advance, volume, loop_track| SegmentConfig {
        segment,
        track_id: segment.label().to_string(),
        advance,
        volume,
        loop_track,
    };

    vec![
        row(
            Segment::Intro,
            AdvancePolicy::Fixed {
                duration_ms: 10_000,
                next: Segment::Build1,
            },
            VolumeMode::Background,
            false,
        ),
        row(
            Segment::Build1,
            AdvancePolicy::Fixed {
                duration_ms: 30_000,
                next: Segment::Build2,
            },
            VolumeMode::Background,
            false,
        ),
        row(
            Segment::Build2,
            AdvancePolicy::SpeedGated {
                duration_ms: 60_000,
                gate: SpeedGate::default(),
            },
            VolumeMode::SpeedCurve,
            true,
        ),
        row(
            Segment::Success,
            AdvancePolicy::Terminal { dwell_ms: 20_000 },
            VolumeMode::Master,
            false,
        ),
        row(
            Segment::Failure,
            AdvancePolicy::Terminal { dwell_ms: 20_000 },
            VolumeMode::Master,
            false,
        ),
    ]
}

impl StoryConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StoryConfig = serde_json::from_str(json)
            .map_err(|e| StoryError::config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| StoryError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn catalog(&self) -> TrackCatalog {
        TrackCatalog::new(self.asset_base.clone(), self.track_extension.clone())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the configuration and build the segment table.
    pub fn segment_table(&self) -> Result<SegmentTable> {
        for segment in Segment::ALL {
            let count = self.segments.iter().filter(|s| s.segment == segment).count();
            if count != 1 {
                return Err(StoryError::config(format!(
                    "segment {:?} configured {} times, expected once",
                    segment, count
                )));
            }
        }

        let row = |segment: Segment| -> Result<SegmentConfig> {
            self.segments
                .iter()
                .find(|s| s.segment == segment)
                .cloned()
                .ok_or_config("segment missing from table")
        };

        let table = SegmentTable {
            rows: [
                row(Segment::Intro)?,
                row(Segment::Build1)?,
                row(Segment::Build2)?,
                row(Segment::Success)?,
                row(Segment::Failure)?,
            ],
        };

        for config in table.iter() {
            validate_segment(config)?;
        }
        Ok(table)
    }

    /// Validate ranges and the segment table.
    pub fn validate(&self) -> Result<()> {
        for (name, volume) in [
            ("background_volume", self.background_volume),
            ("master_volume", self.master_volume),
            ("baseline_volume", self.baseline_volume),
        ] {
            if !(0.0..=1.0).contains(&volume) {
                return Err(StoryError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, volume
                )));
            }
        }
        if !(self.average_speed_divisor.is_finite() && self.average_speed_divisor > 0.0) {
            return Err(StoryError::config("average_speed_divisor must be positive"));
        }
        if self.history_capacity == Some(0) {
            return Err(StoryError::config("history_capacity must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(StoryError::config("poll_interval_ms must be positive"));
        }
        self.segment_table().map(|_| ())
    }
}

fn validate_segment(config: &SegmentConfig) -> Result<()> {
    if config.track_id.is_empty() {
        return Err(StoryError::config(format!(
            "segment {:?} has an empty track_id",
            config.segment
        )));
    }
    if config.advance.duration_ms() == 0 {
        return Err(StoryError::config(format!(
            "segment {:?} must have a positive duration",
            config.segment
        )));
    }

    let is_terminal_policy = matches!(config.advance, AdvancePolicy::Terminal { .. });
    if is_terminal_policy != config.segment.is_terminal() {
        return Err(StoryError::config(format!(
            "segment {:?} must {}use a terminal policy",
            config.segment,
            if config.segment.is_terminal() { "" } else { "not " }
        )));
    }

    if let AdvancePolicy::SpeedGated { gate, .. } = config.advance {
        if gate.retry_threshold > gate.success_threshold {
            return Err(StoryError::config(format!(
                "retry_threshold {} exceeds success_threshold {}",
                gate.retry_threshold, gate.success_threshold
            )));
        }
    }
    Ok(())
}
