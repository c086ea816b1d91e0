//! Distance and speed estimation from consecutive location samples.
//!
//! Distances use a locally-linearized equirectangular approximation: the
//! per-degree lengths of latitude and longitude are evaluated at the mean
//! latitude of the two samples with the usual three-term ellipsoid series.
//! This is accurate to well under a percent for the few-meter to
//! few-kilometer hops between position fixes, and is not a great-circle
//! solver.
//!
//! Speeds are reported in meters per minute.

use std::collections::VecDeque;

use crate::{Coordinate, Result, StoryError};

/// The series coefficients yield kilometers per degree.
const METERS_PER_KILOMETER: f64 = 1000.0;
const MS_PER_MINUTE: f64 = 60_000.0;

/// Distance in meters between two nearby coordinates.
///
/// # Example
/// ```
/// use run_story::{distance, Coordinate};
///
/// let a = Coordinate::new(0.0, 0.0);
/// let b = Coordinate::new(0.0, 0.001);
/// let meters = distance(&a, &b);
/// assert!((meters - 111.32).abs() < 0.01);
/// ```
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi = ((a.latitude + b.latitude) / 2.0).to_radians();

    let km_per_deg_lat =
        111.13209 - 0.56605 * (2.0 * phi).cos() + 0.00120 * (4.0 * phi).cos();
    let km_per_deg_lon =
        111.41513 * phi.cos() - 0.09455 * (3.0 * phi).cos() + 0.00012 * (5.0 * phi).cos();

    let dy = (a.latitude - b.latitude) * km_per_deg_lat;
    let dx = (a.longitude - b.longitude) * km_per_deg_lon;

    dy.hypot(dx) * METERS_PER_KILOMETER
}

/// Displacement recorded between two consecutive coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Milliseconds since epoch when the later coordinate was taken
    pub timestamp: u64,
    /// Meters moved since the previous coordinate
    pub distance: f64,
}

/// Append-only record of displacements within one tracking session.
///
/// With a capacity, the oldest samples are dropped but their distance is
/// kept in a running total, so the average speed is unaffected.
#[derive(Debug, Clone, Default)]
pub struct SpeedHistory {
    samples: VecDeque<SpeedSample>,
    capacity: Option<usize>,
    evicted_distance: f64,
}

impl SpeedHistory {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity,
            evicted_distance: 0.0,
        }
    }

    /// Append a sample, evicting the oldest if at capacity.
    pub fn push(&mut self, sample: SpeedSample) {
        if let Some(capacity) = self.capacity {
            while self.samples.len() >= capacity.max(1) {
                if let Some(old) = self.samples.pop_front() {
                    self.evicted_distance += old.distance;
                }
            }
        }
        self.samples.push_back(sample);
    }

    /// Sum of every distance recorded since the last clear.
    pub fn total_distance(&self) -> f64 {
        self.evicted_distance + self.samples.iter().map(|s| s.distance).sum::<f64>()
    }

    pub fn last(&self) -> Option<&SpeedSample> {
        self.samples.back()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpeedSample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.evicted_distance = 0.0;
    }
}

/// Speed in meters per minute of `sample` relative to the last recorded sample.
///
/// Returns `None` when the history is empty or no time has elapsed.
pub fn instantaneous_speed(history: &SpeedHistory, sample: &SpeedSample) -> Option<f64> {
    history
        .last()
        .and_then(|previous| speed_since(previous.timestamp, sample))
}

fn speed_since(previous_timestamp: u64, sample: &SpeedSample) -> Option<f64> {
    if sample.timestamp <= previous_timestamp {
        return None;
    }
    let minutes = (sample.timestamp - previous_timestamp) as f64 / MS_PER_MINUTE;
    Some(sample.distance / minutes)
}

/// Total recorded distance over a fixed normalization divisor.
pub fn average_speed(history: &SpeedHistory, divisor: f64) -> f64 {
    history.total_distance() / divisor
}

/// Outcome of feeding one coordinate into the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedUpdate {
    /// First coordinate of a tracking session; nothing to measure against
    Anchored,
    /// A displacement was recorded
    Measured {
        sample: SpeedSample,
        instantaneous: f64,
        average: f64,
    },
}

/// Stateful speed tracker for one tracking session.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    history: SpeedHistory,
    last_coordinate: Option<Coordinate>,
    last_sample_time: Option<u64>,
    last_speed: Option<f64>,
    divisor: f64,
}

impl SpeedEstimator {
    pub fn new(divisor: f64, capacity: Option<usize>) -> Self {
        Self {
            history: SpeedHistory::new(capacity),
            last_coordinate: None,
            last_sample_time: None,
            last_speed: None,
            divisor,
        }
    }

    /// Feed a coordinate taken at `timestamp` (ms since epoch).
    ///
    /// A sample with no elapsed time since its predecessor returns
    /// [`StoryError::DegenerateSample`]: its displacement is discarded but the
    /// coordinate becomes the new reference point.
    pub fn record(&mut self, coordinate: Coordinate, timestamp: u64) -> Result<SpeedUpdate> {
        let previous = self.last_coordinate.replace(coordinate);
        let Some((previous, previous_time)) = previous.zip(self.last_sample_time) else {
            self.last_sample_time = Some(timestamp);
            return Ok(SpeedUpdate::Anchored);
        };

        let sample = SpeedSample {
            timestamp,
            distance: distance(&previous, &coordinate),
        };

        // history.last() always carries last_sample_time once non-empty
        let speed = if self.history.is_empty() {
            speed_since(previous_time, &sample)
        } else {
            instantaneous_speed(&self.history, &sample)
        };

        let Some(instantaneous) = speed else {
            return Err(StoryError::DegenerateSample { timestamp });
        };

        self.last_sample_time = Some(timestamp);
        self.last_speed = Some(instantaneous);
        self.history.push(sample);

        Ok(SpeedUpdate::Measured {
            sample,
            instantaneous,
            average: self.average_speed(),
        })
    }

    pub fn average_speed(&self) -> f64 {
        average_speed(&self.history, self.divisor)
    }

    /// Most recent instantaneous speed, if any displacement was measured.
    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }

    pub fn last_coordinate(&self) -> Option<Coordinate> {
        self.last_coordinate
    }

    pub fn last_sample_time(&self) -> Option<u64> {
        self.last_sample_time
    }

    pub fn history(&self) -> &SpeedHistory {
        &self.history
    }

    /// Start a new tracking session: forget history and the reference point.
    pub fn reset(&mut self) {
        self.history.clear();
        self.last_coordinate = None;
        self.last_sample_time = None;
        self.last_speed = None;
    }
}
