//! # Story Machine
//!
//! The narrative state machine. It owns all session state and performs no
//! I/O: every operation returns the [`Effect`]s the caller must carry out
//! (switch track, set volume, schedule a timer, open or close the position
//! feed). Because each operation runs to completion and returns its effects
//! in one go, a transition is never observed half-applied.
//!
//! ## Stale callbacks
//!
//! Every transition bumps an epoch. Timer and feed handles are stamped with
//! the epoch they were issued in, and events carrying an older handle are
//! dropped. A timer left over from a previous segment, or a position fix
//! from a feed that was already closed, can therefore never touch the
//! current segment.

use log::{debug, info, warn};

use crate::config::{AdvancePolicy, SegmentTable, VolumeMode};
use crate::estimator::{SpeedEstimator, SpeedUpdate};
use crate::{Coordinate, Outcome, Result, Segment, StoryConfig, VolumePolicy};

/// Identifies a scheduled segment timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Identifies a position subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedHandle(pub u64);

/// Side effects requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Make `track_id` the playing track (no-op if it already is)
    SwitchTrack { track_id: String },
    /// Play the current track again from the start
    RestartTrack,
    SetVolume(f64),
    /// Call `on_timer` with this handle once `deadline_ms` is reached
    ScheduleTimer { handle: TimerHandle, deadline_ms: u64 },
    CancelTimer(TimerHandle),
    /// Start delivering positions tagged with this handle
    OpenFeed(FeedHandle),
    CloseFeed(FeedHandle),
    /// The terminal dwell is over
    SessionEnded(Outcome),
}

/// Externally visible playback bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub current_segment: Option<Segment>,
    pub volume: f64,
    pub last_sample_time: Option<u64>,
    pub last_coordinate: Option<Coordinate>,
}

/// The narrative state machine for a single session.
#[derive(Debug, Clone)]
pub struct StoryMachine {
    // Configuration
    table: SegmentTable,
    volume_policy: VolumePolicy,
    background_volume: f64,
    master_volume: f64,
    baseline_volume: f64,

    // Session state
    estimator: SpeedEstimator,
    segment: Option<Segment>,
    volume: f64,
    deadline: Option<u64>,
    feed: Option<FeedHandle>,
    epoch: u64,
    started: bool,
    outcome: Option<Outcome>,
    finished: bool,
    /// Times the speed-gated segment was replayed
    retries: u32,
}

impl StoryMachine {
    /// Create an idle machine. Fails if the configuration is invalid.
    pub fn new(config: &StoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: config.segment_table()?,
            volume_policy: config.volume_policy,
            background_volume: config.background_volume,
            master_volume: config.master_volume,
            baseline_volume: config.baseline_volume,
            estimator: SpeedEstimator::new(
                config.average_speed_divisor,
                config.history_capacity,
            ),
            segment: None,
            volume: 0.0,
            deadline: None,
            feed: None,
            epoch: 0,
            started: false,
            outcome: None,
            finished: false,
            retries: 0,
        })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Leave idle and enter the intro. Only the first call has any effect.
    pub fn start(&mut self, now_ms: u64) -> Vec<Effect> {
        if self.started {
            warn!("[StoryMachine] start ignored, session already started");
            return Vec::new();
        }
        self.started = true;
        info!("[StoryMachine] Session started at {}", now_ms);
        self.enter(Segment::Intro, now_ms)
    }

    /// Handle a segment timer firing.
    ///
    /// Stale handles and early firings are ignored.
    pub fn on_timer(&mut self, handle: TimerHandle, now_ms: u64) -> Vec<Effect> {
        if self.finished || handle != TimerHandle(self.epoch) {
            debug!("[StoryMachine] Ignoring stale timer {:?}", handle);
            return Vec::new();
        }
        let (Some(segment), Some(deadline)) = (self.segment, self.deadline) else {
            return Vec::new();
        };
        if now_ms < deadline {
            debug!(
                "[StoryMachine] Timer for {:?} fired {}ms early, ignoring",
                segment,
                deadline - now_ms
            );
            return Vec::new();
        }

        match self.table.get(segment).advance {
            AdvancePolicy::Fixed { next, .. } => self.enter(next, now_ms),
            AdvancePolicy::SpeedGated { gate, .. } => {
                let average = self.estimator.average_speed();
                let next = gate.successor(average);
                info!(
                    "[StoryMachine] Gate closed at average {:.2} m/min: {:?} -> {:?}",
                    average, segment, next
                );
                if next == segment {
                    self.retries += 1;
                }
                self.enter(next, now_ms)
            }
            AdvancePolicy::Terminal { .. } => self.finish(),
        }
    }

    /// Handle a position fix from the feed identified by `handle`.
    ///
    /// `playback_ms` is the current track position, used by the volume
    /// curve. Returns [`crate::StoryError::DegenerateSample`] when no time
    /// passed since the previous fix; the machine state stays consistent.
    pub fn on_position(
        &mut self,
        handle: FeedHandle,
        coordinate: Coordinate,
        now_ms: u64,
        playback_ms: u64,
    ) -> Result<Vec<Effect>> {
        if self.feed != Some(handle) {
            debug!("[StoryMachine] Ignoring position from closed feed {:?}", handle);
            return Ok(Vec::new());
        }
        let Some(segment) = self.segment else {
            return Ok(Vec::new());
        };

        let SpeedUpdate::Measured {
            instantaneous,
            average,
            ..
        } = self.estimator.record(coordinate, now_ms)?
        else {
            return Ok(Vec::new());
        };

        debug!(
            "[StoryMachine] speed {:.1} m/min, average {:.2} m/min",
            instantaneous, average
        );

        if self.table.get(segment).volume != VolumeMode::SpeedCurve {
            return Ok(Vec::new());
        }
        let volume = self.volume_policy.volume_for(instantaneous, playback_ms);
        Ok(self.apply_volume(volume))
    }

    /// Handle the audio engine reporting that `track_id` ended.
    ///
    /// Track ends never advance the story; looping segments restart their
    /// track. An end reported for any other track than the current one is a
    /// leftover from before the last switch and is ignored.
    pub fn on_audio_ended(&mut self, track_id: &str) -> Vec<Effect> {
        if self.current_track() != Some(track_id) {
            debug!("[StoryMachine] Ignoring end of stale track '{}'", track_id);
            return Vec::new();
        }
        match self.segment {
            Some(segment) if self.table.get(segment).loop_track => {
                debug!("[StoryMachine] Looping track for {:?}", segment);
                vec![Effect::RestartTrack]
            }
            _ => Vec::new(),
        }
    }

    /// Return to idle, dropping all session state.
    pub fn reset(&mut self) -> Vec<Effect> {
        let mut effects = self.release_handles();
        self.epoch += 1;
        self.estimator.reset();
        self.segment = None;
        self.volume = 0.0;
        self.deadline = None;
        self.started = false;
        self.outcome = None;
        self.finished = false;
        self.retries = 0;
        info!("[StoryMachine] Reset to idle");
        effects
    }

    fn enter(&mut self, segment: Segment, now_ms: u64) -> Vec<Effect> {
        let mut effects = self.release_handles();
        self.epoch += 1;

        let row = self.table.get(segment);
        let track_id = row.track_id.clone();
        let advance = row.advance;
        let volume_mode = row.volume;

        info!("[StoryMachine] {:?} -> {:?}", self.segment, segment);
        self.segment = Some(segment);
        if let Some(outcome) = segment.outcome() {
            self.outcome = Some(outcome);
        }

        effects.push(Effect::SwitchTrack { track_id });

        self.volume = match volume_mode {
            VolumeMode::Background => self.background_volume,
            VolumeMode::SpeedCurve => self.baseline_volume,
            VolumeMode::Master => self.master_volume,
        };
        effects.push(Effect::SetVolume(self.volume));

        if advance.tracks_speed() {
            self.estimator.reset();
            let feed = FeedHandle(self.epoch);
            self.feed = Some(feed);
            effects.push(Effect::OpenFeed(feed));
        }

        let deadline = now_ms + advance.duration_ms();
        self.deadline = Some(deadline);
        effects.push(Effect::ScheduleTimer {
            handle: TimerHandle(self.epoch),
            deadline_ms: deadline,
        });

        effects
    }

    fn finish(&mut self) -> Vec<Effect> {
        let mut effects = self.release_handles();
        self.epoch += 1;
        self.finished = true;
        self.segment = None;
        self.deadline = None;
        self.estimator.reset();

        if let Some(outcome) = self.outcome {
            info!("[StoryMachine] Session ended: {:?}", outcome);
            effects.push(Effect::SessionEnded(outcome));
        }
        effects
    }

    /// Cancel the current timer and close the feed, if any.
    fn release_handles(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.deadline.is_some() {
            effects.push(Effect::CancelTimer(TimerHandle(self.epoch)));
        }
        if let Some(feed) = self.feed.take() {
            effects.push(Effect::CloseFeed(feed));
        }
        effects
    }

    fn apply_volume(&mut self, volume: f64) -> Vec<Effect> {
        if volume == self.volume {
            return Vec::new();
        }
        self.volume = volume;
        vec![Effect::SetVolume(volume)]
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn current_segment(&self) -> Option<Segment> {
        self.segment
    }

    /// Track id of the current segment.
    pub fn current_track(&self) -> Option<&str> {
        self.segment
            .map(|segment| self.table.get(segment).track_id.as_str())
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Average speed (m/min) of the current tracking session.
    pub fn average_speed(&self) -> f64 {
        self.estimator.average_speed()
    }

    pub fn instantaneous_speed(&self) -> Option<f64> {
        self.estimator.last_speed()
    }

    /// Outcome, known as soon as a terminal segment is entered.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Whether the terminal dwell has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Deadline of the current segment timer.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline
    }

    pub fn active_feed(&self) -> Option<FeedHandle> {
        self.feed
    }

    pub fn active_timer(&self) -> Option<TimerHandle> {
        self.deadline.map(|_| TimerHandle(self.epoch))
    }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState {
            current_segment: self.segment,
            volume: self.volume,
            last_sample_time: self.estimator.last_sample_time(),
            last_coordinate: self.estimator.last_coordinate(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{distance, StoryError};

    const GATE_ENTRY_MS: u64 = 40_000;

    fn machine() -> StoryMachine {
        StoryMachine::new(&StoryConfig::default()).unwrap()
    }

    fn scheduled(effects: &[Effect]) -> Option<(TimerHandle, u64)> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleTimer {
                handle,
                deadline_ms,
            } => Some((*handle, *deadline_ms)),
            _ => None,
        })
    }

    /// Start at t=0 and advance through the fixed segments into the gate.
    fn run_to_gate(machine: &mut StoryMachine) -> FeedHandle {
        machine.start(0);
        let intro = machine.active_timer().unwrap();
        machine.on_timer(intro, 10_000);
        let build1 = machine.active_timer().unwrap();
        machine.on_timer(build1, GATE_ENTRY_MS);
        assert_eq!(machine.current_segment(), Some(Segment::Build2));
        machine.active_feed().unwrap()
    }

    /// Machine whose single gated hop produces exactly `average` m/min.
    fn machine_reaching_average(average: f64) -> (StoryMachine, FeedHandle) {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 0.01);
        let config = StoryConfig {
            average_speed_divisor: distance(&a, &b) / average,
            ..StoryConfig::default()
        };
        let mut machine = StoryMachine::new(&config).unwrap();
        let feed = run_to_gate(&mut machine);

        machine.on_position(feed, a, 45_000, 0).unwrap();
        machine.on_position(feed, b, 50_000, 0).unwrap();
        (machine, feed)
    }

    #[test]
    fn test_new_machine_is_idle() {
        let machine = machine();
        assert_eq!(machine.current_segment(), None);
        assert!(!machine.is_started());
        assert_eq!(machine.active_timer(), None);
        assert_eq!(machine.playback_state().last_coordinate, None);
    }

    #[test]
    fn test_start_enters_intro_once() {
        let mut machine = machine();
        let effects = machine.start(1_000);

        assert_eq!(machine.current_segment(), Some(Segment::Intro));
        assert_eq!(
            effects[0],
            Effect::SwitchTrack {
                track_id: "a".to_string()
            }
        );
        assert!(effects.contains(&Effect::SetVolume(0.1)));
        assert_eq!(scheduled(&effects).map(|(_, d)| d), Some(11_000));

        assert!(machine.start(2_000).is_empty());
        assert_eq!(machine.deadline_ms(), Some(11_000));
    }

    #[test]
    fn test_intro_advances_at_exactly_ten_seconds() {
        let mut machine = machine();
        let effects = machine.start(0);
        let (timer, _) = scheduled(&effects).unwrap();

        assert!(machine.on_timer(timer, 9_999).is_empty());
        assert_eq!(machine.current_segment(), Some(Segment::Intro));

        let effects = machine.on_timer(timer, 10_000);
        assert_eq!(machine.current_segment(), Some(Segment::Build1));
        assert!(effects.contains(&Effect::CancelTimer(timer)));
        assert_eq!(scheduled(&effects).map(|(_, d)| d), Some(40_000));
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut machine = machine();
        let (intro_timer, _) = scheduled(&machine.start(0)).unwrap();
        machine.on_timer(intro_timer, 10_000);

        // The superseded intro timer fires again late
        assert!(machine.on_timer(intro_timer, 45_000).is_empty());
        assert_eq!(machine.current_segment(), Some(Segment::Build1));
    }

    #[test]
    fn test_entering_gate_opens_feed_at_baseline_volume() {
        let mut machine = machine();
        machine.start(0);
        machine.on_timer(machine.active_timer().unwrap(), 10_000);
        let effects = machine.on_timer(machine.active_timer().unwrap(), 40_000);

        let feed = machine.active_feed().unwrap();
        assert!(effects.contains(&Effect::OpenFeed(feed)));
        assert!(effects.contains(&Effect::SetVolume(0.025)));
        assert!(effects.contains(&Effect::SwitchTrack {
            track_id: "c".to_string()
        }));
        assert_eq!(machine.current_track(), Some("c"));
        assert_eq!(machine.deadline_ms(), Some(100_000));
    }

    #[test]
    fn test_positions_outside_gate_are_ignored() {
        let mut machine = machine();
        machine.start(0);

        let effects = machine
            .on_position(FeedHandle(1), Coordinate::new(0.0, 0.0), 1_000, 0)
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(machine.playback_state().last_coordinate, None);
    }

    #[test]
    fn test_position_drives_volume_curve() {
        let mut machine = machine();
        let feed = run_to_gate(&mut machine);

        // First fix only anchors
        let effects = machine
            .on_position(feed, Coordinate::new(0.0, 0.0), 45_000, 0)
            .unwrap();
        assert!(effects.is_empty());

        // ~111m in 30s = ~222 m/min -> 0.05 on the extended curve
        let effects = machine
            .on_position(feed, Coordinate::new(0.0, 0.001), 75_000, 0)
            .unwrap();
        assert_eq!(effects, vec![Effect::SetVolume(0.05)]);
        assert_eq!(machine.volume(), 0.05);

        let speed = machine.instantaneous_speed().unwrap();
        assert!((speed - 222.6414).abs() < 0.01);
        assert_eq!(machine.playback_state().last_sample_time, Some(75_000));
    }

    #[test]
    fn test_unchanged_volume_emits_nothing() {
        let mut machine = machine();
        let feed = run_to_gate(&mut machine);

        machine
            .on_position(feed, Coordinate::new(0.0, 0.0), 45_000, 0)
            .unwrap();
        machine
            .on_position(feed, Coordinate::new(0.0, 0.001), 75_000, 0)
            .unwrap();
        let again = machine
            .on_position(feed, Coordinate::new(0.0, 0.002), 105_000, 0)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_degenerate_sample_reports_error() {
        let mut machine = machine();
        let feed = run_to_gate(&mut machine);

        machine
            .on_position(feed, Coordinate::new(0.0, 0.0), 45_000, 0)
            .unwrap();
        let result = machine.on_position(feed, Coordinate::new(0.0, 0.001), 45_000, 0);

        assert_eq!(
            result,
            Err(StoryError::DegenerateSample { timestamp: 45_000 })
        );
        assert_eq!(machine.average_speed(), 0.0);
        assert_eq!(
            machine.playback_state().last_coordinate,
            Some(Coordinate::new(0.0, 0.001))
        );
    }

    #[test]
    fn test_gate_success() {
        let (mut machine, _) = machine_reaching_average(260.0);
        assert!(machine.average_speed() >= 250.0);

        let effects = machine.on_timer(machine.active_timer().unwrap(), 100_000);
        assert_eq!(machine.current_segment(), Some(Segment::Success));
        assert_eq!(machine.outcome(), Some(Outcome::Success));
        assert!(effects.contains(&Effect::SetVolume(1.0)));
        assert!(effects.iter().any(|e| matches!(e, Effect::CloseFeed(_))));
        assert_eq!(machine.active_feed(), None);
    }

    #[test]
    fn test_gate_retry_restarts_segment() {
        let (mut machine, old_feed) = machine_reaching_average(200.0);

        let effects = machine.on_timer(machine.active_timer().unwrap(), 100_000);
        assert_eq!(machine.current_segment(), Some(Segment::Build2));
        assert_eq!(machine.retries(), 1);
        assert_eq!(machine.deadline_ms(), Some(160_000));

        // Fresh tracking session on a new feed
        let new_feed = machine.active_feed().unwrap();
        assert_ne!(new_feed, old_feed);
        assert!(effects.contains(&Effect::CloseFeed(old_feed)));
        assert!(effects.contains(&Effect::OpenFeed(new_feed)));
        assert!(effects.contains(&Effect::SetVolume(0.025)));
        assert_eq!(machine.average_speed(), 0.0);
        assert_eq!(machine.playback_state().last_coordinate, None);
    }

    #[test]
    fn test_gate_failure() {
        let (mut machine, _) = machine_reaching_average(100.0);

        machine.on_timer(machine.active_timer().unwrap(), 100_000);
        assert_eq!(machine.current_segment(), Some(Segment::Failure));
        assert_eq!(machine.outcome(), Some(Outcome::Failure));
    }

    #[test]
    fn test_closed_feed_cannot_mutate_state() {
        let (mut machine, old_feed) = machine_reaching_average(200.0);
        machine.on_timer(machine.active_timer().unwrap(), 100_000);
        let before = machine.playback_state();

        let effects = machine
            .on_position(old_feed, Coordinate::new(1.0, 1.0), 101_000, 0)
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(machine.playback_state(), before);
    }

    #[test]
    fn test_terminal_dwell_ends_session() {
        let (mut machine, _) = machine_reaching_average(260.0);
        machine.on_timer(machine.active_timer().unwrap(), 100_000);

        let dwell = machine.active_timer().unwrap();
        assert!(machine.on_timer(dwell, 119_999).is_empty());

        let effects = machine.on_timer(dwell, 120_000);
        assert!(effects.contains(&Effect::SessionEnded(Outcome::Success)));
        assert!(machine.is_finished());
        assert_eq!(machine.current_segment(), None);
        assert_eq!(machine.active_timer(), None);

        // Nothing fires after the end
        assert!(machine.on_timer(dwell, 200_000).is_empty());
    }

    #[test]
    fn test_audio_end_loops_only_looping_segments() {
        let mut machine = machine();
        machine.start(0);
        assert!(machine.on_audio_ended("a").is_empty());

        let mut gated = StoryMachine::new(&StoryConfig::default()).unwrap();
        run_to_gate(&mut gated);
        assert_eq!(gated.on_audio_ended("c"), vec![Effect::RestartTrack]);
        assert_eq!(gated.current_segment(), Some(Segment::Build2));
    }

    #[test]
    fn test_audio_end_of_previous_track_is_ignored() {
        let mut machine = machine();
        run_to_gate(&mut machine);

        // build-1's track reports its end just after the switch to "c"
        assert!(machine.on_audio_ended("b").is_empty());
        assert!(machine.on_audio_ended("").is_empty());
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut machine = machine();
        let feed = run_to_gate(&mut machine);
        let timer = machine.active_timer().unwrap();

        let effects = machine.reset();
        assert!(effects.contains(&Effect::CloseFeed(feed)));
        assert!(effects.contains(&Effect::CancelTimer(timer)));
        assert_eq!(machine.current_segment(), None);
        assert!(!machine.is_started());

        // A fresh start works again
        machine.start(500_000);
        assert_eq!(machine.current_segment(), Some(Segment::Intro));
    }
}
