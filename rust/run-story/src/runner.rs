//! Async session loop.
//!
//! [`StoryRunner`] drives a [`StoryEngine`] from three event sources on a
//! single task: the pending segment timer, the open position subscription
//! and the audio engine's lifecycle events. Each event is handled to
//! completion before the next one is polled, and after every event the
//! runner reconciles the position subscription with what the engine wants,
//! so a closed feed is dropped (and thereby cancelled) before anything else
//! is read from it.

use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::OptionExt;
use crate::machine::FeedHandle;
use crate::{
    AudioEvent, AudioPlayer, Outcome, PositionReading, PositionSource, Result, StoryEngine,
    StorySnapshot,
};

/// Maps tokio time onto session timestamps (ms since epoch).
///
/// The wall clock is read once; afterwards time comes from tokio, so a
/// paused test runtime drives the session deterministically.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch_ms: u64,
    origin: Instant,
}

impl SessionClock {
    /// Anchor at the current wall-clock time.
    pub fn start() -> Self {
        let epoch_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self::anchored_at(epoch_ms)
    }

    /// Anchor at a given timestamp.
    pub fn anchored_at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + self.origin.elapsed().as_millis() as u64
    }

    /// The tokio instant corresponding to a session timestamp.
    pub fn instant_at(&self, timestamp_ms: u64) -> Instant {
        self.origin + Duration::from_millis(timestamp_ms.saturating_sub(self.epoch_ms))
    }
}

struct Subscription {
    handle: FeedHandle,
    receiver: mpsc::Receiver<PositionReading>,
}

/// Runs one session to its outcome.
pub struct StoryRunner<P: AudioPlayer, S: PositionSource> {
    engine: StoryEngine<P>,
    source: S,
    audio_events: mpsc::Receiver<AudioEvent>,
    snapshots: watch::Sender<StorySnapshot>,
    feed: Option<Subscription>,
    /// Feed whose producer hung up; not reopened
    exhausted_feed: Option<FeedHandle>,
    audio_open: bool,
}

impl<P: AudioPlayer, S: PositionSource> StoryRunner<P, S> {
    /// Build a runner and the snapshot channel the presentation layer watches.
    pub fn new(
        engine: StoryEngine<P>,
        source: S,
        audio_events: mpsc::Receiver<AudioEvent>,
    ) -> (Self, watch::Receiver<StorySnapshot>) {
        let (snapshots, receiver) = watch::channel(engine.snapshot());
        let runner = Self {
            engine,
            source,
            audio_events,
            snapshots,
            feed: None,
            exhausted_feed: None,
            audio_open: true,
        };
        (runner, receiver)
    }

    /// Start the story and process events until the session ends.
    pub async fn run(self) -> Result<Outcome> {
        self.run_with_clock(SessionClock::start()).await
    }

    pub async fn run_with_clock(mut self, clock: SessionClock) -> Result<Outcome> {
        self.engine.start(clock.now_ms());
        self.publish();

        loop {
            if let Some(outcome) = self.engine.ended() {
                info!("[StoryRunner] Finished with {:?}", outcome);
                return Ok(outcome);
            }
            self.sync_feed();

            let timer = self.engine.pending_timer();
            let wake_at = timer
                .map(|t| clock.instant_at(t.deadline_ms))
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at), if timer.is_some() => {
                    if let Some(timer) = timer {
                        self.engine.handle_timer(timer.handle, clock.now_ms());
                    }
                }
                reading = next_reading(&mut self.feed), if self.feed.is_some() => {
                    match reading {
                        Some((handle, reading)) => {
                            self.engine.handle_position(handle, reading, clock.now_ms());
                        }
                        None => {
                            debug!("[StoryRunner] Position source closed");
                            self.exhausted_feed = self.feed.take().map(|s| s.handle);
                        }
                    }
                }
                event = self.audio_events.recv(), if self.audio_open => {
                    match event {
                        Some(event) => self.engine.handle_audio(event),
                        None => {
                            debug!("[StoryRunner] Audio events closed");
                            self.audio_open = false;
                        }
                    }
                }
                else => {
                    return self
                        .engine
                        .ended()
                        .ok_or_internal("session stalled with no pending events");
                }
            }

            self.publish();
        }
    }

    /// Open or drop the position subscription to match the engine.
    fn sync_feed(&mut self) {
        let wanted = self.engine.active_feed();
        let current = self.feed.as_ref().map(|s| s.handle);
        if current == wanted || (current.is_none() && wanted == self.exhausted_feed) {
            return;
        }

        if let Some(old) = self.feed.take() {
            debug!("[StoryRunner] Unsubscribing feed {:?}", old.handle);
        }
        if let Some(handle) = wanted {
            debug!("[StoryRunner] Subscribing feed {:?}", handle);
            self.feed = Some(Subscription {
                handle,
                receiver: self.source.subscribe(),
            });
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.engine.snapshot());
    }
}

async fn next_reading(feed: &mut Option<Subscription>) -> Option<(FeedHandle, PositionReading)> {
    match feed {
        Some(subscription) => {
            let handle = subscription.handle;
            subscription.receiver.recv().await.map(|r| (handle, r))
        }
        None => std::future::pending().await,
    }
}
