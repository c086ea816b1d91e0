//! Position sources.
//!
//! A subscription is a `tokio` channel of [`PositionReading`]s. Dropping the
//! receiver cancels it: producers notice the closed channel and stop.
//!
//! Two shapes of source are supported:
//! - any closure returning a fresh receiver (continuous "watch" style feeds)
//! - [`PollingFeed`], which asks a synchronous [`PositionSampler`] for a fix
//!   on a fixed period

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::{Coordinate, Result, StoryError};

/// A position fix, or the reason none could be taken.
pub type PositionReading = Result<Coordinate>;

const SUBSCRIPTION_BUFFER: usize = 16;

/// Opens position subscriptions on demand.
pub trait PositionSource {
    fn subscribe(&mut self) -> mpsc::Receiver<PositionReading>;
}

impl<F> PositionSource for F
where
    F: FnMut() -> mpsc::Receiver<PositionReading>,
{
    fn subscribe(&mut self) -> mpsc::Receiver<PositionReading> {
        self()
    }
}

/// One-shot access to the platform location service.
pub trait PositionSampler: Send + Sync + 'static {
    fn sample(&self) -> PositionReading;
}

/// Polls a sampler every `interval`, starting one interval after subscribing.
///
/// Fixes with out-of-range coordinates are delivered as
/// [`StoryError::SensorUnavailable`].
pub struct PollingFeed<S: PositionSampler> {
    sampler: Arc<S>,
    interval: Duration,
}

impl<S: PositionSampler> PollingFeed<S> {
    pub fn new(sampler: S, interval: Duration) -> Self {
        Self {
            sampler: Arc::new(sampler),
            interval,
        }
    }

    /// Shared access to the sampler, e.g. to inspect a scripted one.
    pub fn sampler(&self) -> &Arc<S> {
        &self.sampler
    }
}

impl<S: PositionSampler> PositionSource for PollingFeed<S> {
    /// Spawns the polling task on the current tokio runtime.
    fn subscribe(&mut self) -> mpsc::Receiver<PositionReading> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let sampler = Arc::clone(&self.sampler);
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let reading = sampler.sample().and_then(validate);
                if tx.send(reading).await.is_err() {
                    debug!("[PollingFeed] Subscription dropped, stopping");
                    break;
                }
            }
        });

        rx
    }
}

fn validate(coordinate: Coordinate) -> PositionReading {
    if coordinate.is_valid() {
        Ok(coordinate)
    } else {
        Err(StoryError::SensorUnavailable {
            message: format!(
                "invalid fix ({}, {})",
                coordinate.latitude, coordinate.longitude
            ),
        })
    }
}
