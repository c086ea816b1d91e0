//! # Story Engine
//!
//! Binds a [`StoryMachine`] to an [`AudioPlayer`]. Event sources call the
//! engine; the engine forwards to the machine and carries out the returned
//! effects against the player, keeping track of which timer and position
//! subscription are currently live.
//!
//! Playback failures and sensor errors are logged and reported to the
//! optional error callback. They never stop the narrative clock.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::machine::{Effect, FeedHandle, StoryMachine, TimerHandle};
use crate::{
    AudioEvent, AudioPlayer, Outcome, PositionReading, Result, Segment, StoryConfig, StoryError,
    TrackCatalog,
};

/// Observability hook for non-fatal errors.
pub type ErrorCallback = Arc<dyn Fn(&StoryError) + Send + Sync>;

/// The single timer the session currently waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub handle: TimerHandle,
    pub deadline_ms: u64,
}

/// What the presentation layer shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySnapshot {
    pub segment: Option<Segment>,
    pub track_id: Option<String>,
    /// Average speed of the current tracking session (m/min)
    pub average_speed: f64,
    /// Most recent instantaneous speed (m/min)
    pub instantaneous_speed: Option<f64>,
    pub volume: f64,
    /// Known once a terminal segment is entered
    pub outcome: Option<Outcome>,
    /// True once the terminal dwell is over
    pub finished: bool,
    pub retries: u32,
}

/// Runs one story session against an audio player.
pub struct StoryEngine<P: AudioPlayer> {
    machine: StoryMachine,
    player: P,
    catalog: TrackCatalog,
    timer: Option<PendingTimer>,
    feed: Option<FeedHandle>,
    ended: Option<Outcome>,
    on_error: Option<ErrorCallback>,
}

impl<P: AudioPlayer> StoryEngine<P> {
    /// Create an idle engine. Fails if the configuration is invalid.
    pub fn new(config: StoryConfig, player: P) -> Result<Self> {
        let machine = StoryMachine::new(&config)?;
        Ok(Self {
            machine,
            player,
            catalog: config.catalog(),
            timer: None,
            feed: None,
            ended: None,
            on_error: None,
        })
    }

    /// Report non-fatal errors to `callback` in addition to the log.
    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    // ========================================================================
    // Event Entry Points
    // ========================================================================

    /// Start the story.
    pub fn start(&mut self, now_ms: u64) {
        let effects = self.machine.start(now_ms);
        self.apply(effects);
    }

    /// A scheduled timer fired.
    ///
    /// The pending timer is only released through the machine's
    /// `CancelTimer` effect, so an early firing leaves it in place.
    pub fn handle_timer(&mut self, handle: TimerHandle, now_ms: u64) {
        let effects = self.machine.on_timer(handle, now_ms);
        self.apply(effects);
    }

    /// A reading arrived on the subscription `handle`.
    pub fn handle_position(&mut self, handle: FeedHandle, reading: PositionReading, now_ms: u64) {
        let coordinate = match reading {
            Ok(coordinate) => coordinate,
            Err(e) => {
                // Speed simply does not update this tick
                warn!("[StoryEngine] {}", e);
                self.report(&e);
                return;
            }
        };

        let playback_ms = self.player.position_ms();
        match self
            .machine
            .on_position(handle, coordinate, now_ms, playback_ms)
        {
            Ok(effects) => self.apply(effects),
            Err(e) => {
                debug!("[StoryEngine] Discarding sample: {}", e);
                self.report(&e);
            }
        }
    }

    /// The audio engine signalled end of track or an error.
    pub fn handle_audio(&mut self, event: AudioEvent) {
        match event {
            AudioEvent::Ended { track_id } => {
                let effects = self.machine.on_audio_ended(&track_id);
                self.apply(effects);
            }
            AudioEvent::Error { message } => {
                let error = StoryError::PlaybackFailure {
                    track_id: self.player.current_track().unwrap_or_default(),
                    message,
                };
                warn!("[StoryEngine] {}", error);
                self.report(&error);
            }
        }
    }

    /// Abandon the session and return to idle.
    pub fn reset(&mut self) {
        let effects = self.machine.reset();
        self.apply(effects);
        self.player.stop();
        self.ended = None;
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SwitchTrack { track_id } => self.switch_track(&track_id),
                Effect::RestartTrack => {
                    self.player.seek_to_start();
                    self.play();
                }
                Effect::SetVolume(volume) => self.player.set_volume(volume),
                Effect::ScheduleTimer {
                    handle,
                    deadline_ms,
                } => {
                    self.timer = Some(PendingTimer {
                        handle,
                        deadline_ms,
                    });
                }
                Effect::CancelTimer(handle) => {
                    if self.timer.map(|t| t.handle) == Some(handle) {
                        self.timer = None;
                    }
                }
                Effect::OpenFeed(handle) => self.feed = Some(handle),
                Effect::CloseFeed(handle) => {
                    if self.feed == Some(handle) {
                        self.feed = None;
                    }
                }
                Effect::SessionEnded(outcome) => {
                    info!("[StoryEngine] Session ended with {:?}", outcome);
                    self.timer = None;
                    self.feed = None;
                    self.ended = Some(outcome);
                }
            }
        }
    }

    fn switch_track(&mut self, track_id: &str) {
        if self.player.current_track().as_deref() == Some(track_id) {
            debug!("[StoryEngine] Track '{}' already loaded", track_id);
            return;
        }

        self.player.pause();
        self.player.seek_to_start();
        let path = self.catalog.resolve(track_id);
        info!("[StoryEngine] Loading track '{}' from {}", track_id, path);
        if let Err(e) = self.player.load(track_id, &path) {
            warn!("[StoryEngine] {}", e);
            self.report(&e);
            return;
        }
        self.play();
    }

    fn play(&mut self) {
        if let Err(e) = self.player.play() {
            warn!("[StoryEngine] {}", e);
            self.report(&e);
        }
    }

    fn report(&self, error: &StoryError) {
        if let Some(callback) = &self.on_error {
            callback(error);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Timer the session loop should wait for next.
    pub fn pending_timer(&self) -> Option<PendingTimer> {
        self.timer
    }

    /// Position subscription that should currently be open.
    pub fn active_feed(&self) -> Option<FeedHandle> {
        self.feed
    }

    /// Outcome once the session has ended.
    pub fn ended(&self) -> Option<Outcome> {
        self.ended
    }

    pub fn machine(&self) -> &StoryMachine {
        &self.machine
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn snapshot(&self) -> StorySnapshot {
        StorySnapshot {
            segment: self.machine.current_segment(),
            track_id: self.machine.current_track().map(str::to_string),
            average_speed: self.machine.average_speed(),
            instantaneous_speed: self.machine.instantaneous_speed(),
            volume: self.machine.volume(),
            outcome: self.machine.outcome(),
            finished: self.machine.is_finished(),
            retries: self.machine.retries(),
        }
    }

    /// Snapshot as JSON for the presentation layer.
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
