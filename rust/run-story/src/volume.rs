//! Speed to volume curves for the speed-gated segment.
//!
//! The volume is effort feedback: the faster the runner moves, the quieter
//! the chase track gets. Speeds are in meters per minute.

use serde::{Deserialize, Serialize};

/// Playback time after which a stalled runner gets full volume again.
const IDLE_RECOVERY_MS: u64 = 5000;

/// Which step function maps speed to volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumePolicy {
    /// Three buckets: loud below 50, half below 150, quiet above
    Simple,
    /// Eight buckets with idle recovery for a stalled runner
    #[default]
    Extended,
}

impl VolumePolicy {
    /// Volume in [0, 1] for an instantaneous speed.
    ///
    /// `playback_ms` is the position of the current track; only the
    /// extended policy looks at it.
    pub fn volume_for(&self, speed: f64, playback_ms: u64) -> f64 {
        match self {
            VolumePolicy::Simple => simple_volume(speed),
            VolumePolicy::Extended => extended_volume(speed, playback_ms),
        }
    }
}

pub fn simple_volume(speed: f64) -> f64 {
    if speed < 50.0 {
        1.0
    } else if speed < 150.0 {
        0.5
    } else {
        0.1
    }
}

pub fn extended_volume(speed: f64, playback_ms: u64) -> f64 {
    if playback_ms > IDLE_RECOVERY_MS && speed == 0.0 {
        return 1.0;
    }
    match speed {
        s if s >= 250.0 => 0.0,
        s if s >= 200.0 => 0.05,
        s if s >= 150.0 => 0.1,
        s if s >= 100.0 => 0.15,
        s if s >= 60.0 => 0.2,
        s if s >= 20.0 => 0.85,
        s if s >= 10.0 => 1.0,
        _ => 0.05,
    }
}
