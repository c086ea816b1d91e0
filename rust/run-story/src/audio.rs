//! Audio playback seam.
//!
//! The platform audio engine sits behind [`AudioPlayer`]. Its asynchronous
//! lifecycle signals (track ended, playback error) arrive separately as
//! [`AudioEvent`] values so the session loop can order them with position
//! and timer events.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, StoryError};

/// Commands the story issues to the audio engine.
pub trait AudioPlayer {
    /// Load a track resource, replacing whatever was loaded.
    fn load(&mut self, track_id: &str, path: &str) -> Result<()>;

    /// Begin or resume playback of the loaded track.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn seek_to_start(&mut self);

    /// Stop playback and unload the track.
    fn stop(&mut self);

    /// Set output volume in [0, 1].
    fn set_volume(&mut self, volume: f64);

    /// Current playback position of the loaded track.
    fn position_ms(&self) -> u64;

    /// Identifier of the loaded track, if any.
    fn current_track(&self) -> Option<String>;
}

/// Lifecycle signals from the audio engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// `track_id` played to its end
    Ended { track_id: String },
    /// The engine reported an error for the loaded track
    Error { message: String },
}

/// Everything a [`RecordingPlayer`] has been asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioLog {
    pub current_track: Option<String>,
    pub current_path: Option<String>,
    pub volume: f64,
    pub playing: bool,
    pub position_ms: u64,
    /// Track ids in load order
    pub loads: Vec<String>,
    pub play_count: u32,
    pub seek_count: u32,
    /// Every volume set, in order
    pub volume_changes: Vec<f64>,
    /// Make the next `play` call fail with this message
    pub fail_next_play: Option<String>,
}

/// In-memory player for headless sessions and tests.
///
/// Clones share one log, so a clone kept outside the engine can inspect and
/// steer what the engine did.
#[derive(Debug, Clone, Default)]
pub struct RecordingPlayer {
    log: Arc<Mutex<AudioLog>>,
}

impl RecordingPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded state.
    pub fn log(&self) -> AudioLog {
        self.lock().clone()
    }

    /// Pretend the track has played up to `position_ms`.
    pub fn set_position_ms(&self, position_ms: u64) {
        self.lock().position_ms = position_ms;
    }

    /// Fail the next `play` call, as a blocked autoplay would.
    pub fn fail_next_play(&self, message: impl Into<String>) {
        self.lock().fail_next_play = Some(message.into());
    }

    fn lock(&self) -> MutexGuard<'_, AudioLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AudioPlayer for RecordingPlayer {
    fn load(&mut self, track_id: &str, path: &str) -> Result<()> {
        let mut log = self.lock();
        log.current_track = Some(track_id.to_string());
        log.current_path = Some(path.to_string());
        log.loads.push(track_id.to_string());
        log.position_ms = 0;
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        let mut log = self.lock();
        if let Some(message) = log.fail_next_play.take() {
            log.playing = false;
            return Err(StoryError::PlaybackFailure {
                track_id: log.current_track.clone().unwrap_or_default(),
                message,
            });
        }
        log.playing = true;
        log.play_count += 1;
        Ok(())
    }

    fn pause(&mut self) {
        self.lock().playing = false;
    }

    fn seek_to_start(&mut self) {
        let mut log = self.lock();
        log.position_ms = 0;
        log.seek_count += 1;
    }

    fn stop(&mut self) {
        let mut log = self.lock();
        log.playing = false;
        log.position_ms = 0;
        log.current_track = None;
        log.current_path = None;
    }

    fn set_volume(&mut self, volume: f64) {
        let mut log = self.lock();
        log.volume = volume;
        log.volume_changes.push(volume);
    }

    fn position_ms(&self) -> u64 {
        self.lock().position_ms
    }

    fn current_track(&self) -> Option<String> {
        self.lock().current_track.clone()
    }
}
