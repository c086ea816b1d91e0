//! End-to-end sessions on a paused tokio clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use run_story::{
    AudioEvent, Coordinate, Outcome, PollingFeed, PositionReading, PositionSampler,
    RecordingPlayer, Segment, StoryConfig, StoryEngine, StoryRunner,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Alternates between two points 15 degrees of longitude apart on the equator.
struct Shuttle {
    calls: AtomicU32,
}

impl PositionSampler for Shuttle {
    fn sample(&self) -> PositionReading {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let longitude = if n % 2 == 0 { 0.0 } else { 15.0 };
        Ok(Coordinate::new(0.0, longitude))
    }
}

fn engine(player: &RecordingPlayer) -> StoryEngine<RecordingPlayer> {
    StoryEngine::new(StoryConfig::default(), player.clone()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_intro_hands_over_at_ten_seconds() {
    init_logging();
    let player = RecordingPlayer::new();
    let (_audio_tx, audio_rx) = mpsc::channel(4);
    let source = || mpsc::channel::<PositionReading>(1).1;
    let (runner, mut snapshots) = StoryRunner::new(engine(&player), source, audio_rx);

    let task = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_millis(9_999)).await;
    {
        let snapshot = snapshots.borrow_and_update();
        assert_eq!(snapshot.segment, Some(Segment::Intro));
        assert_eq!(snapshot.track_id.as_deref(), Some("a"));
        assert!((snapshot.volume - 0.1).abs() < 1e-9);
    }

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(snapshots.borrow_and_update().segment, Some(Segment::Build1));
    assert_eq!(player.log().current_track.as_deref(), Some("b"));

    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_fast_runner_reaches_success() {
    init_logging();
    let player = RecordingPlayer::new();
    let (_audio_tx, audio_rx) = mpsc::channel(4);
    let feed = PollingFeed::new(
        Shuttle {
            calls: AtomicU32::new(0),
        },
        StoryConfig::default().poll_interval(),
    );
    let (runner, mut snapshots) = StoryRunner::new(engine(&player), feed, audio_rx);

    let start = Instant::now();
    let task = tokio::spawn(runner.run());

    // Gate resolves at 100s, the terminal dwell runs for another 20s
    tokio::time::sleep(Duration::from_millis(100_001)).await;
    {
        let snapshot = snapshots.borrow_and_update();
        assert_eq!(snapshot.segment, Some(Segment::Success));
        assert_eq!(snapshot.outcome, Some(Outcome::Success));
        assert!(snapshot.average_speed >= 250.0, "average {}", snapshot.average_speed);
        assert!(!snapshot.finished);
    }

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(start.elapsed(), Duration::from_secs(120));
    assert_eq!(player.log().loads, vec!["a", "b", "c", "d"]);

    let snapshot = snapshots.borrow();
    assert!(snapshot.finished);
    assert_eq!(snapshot.outcome, Some(Outcome::Success));
    assert_eq!(snapshot.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_feed_closed_when_gate_resolves() {
    init_logging();
    let player = RecordingPlayer::new();
    let (_audio_tx, audio_rx) = mpsc::channel(4);

    let senders: Arc<Mutex<Vec<mpsc::Sender<PositionReading>>>> = Arc::default();
    let opened = Arc::clone(&senders);
    let source = move || {
        let (tx, rx) = mpsc::channel(8);
        opened.lock().unwrap().push(tx);
        rx
    };
    let (runner, mut snapshots) = StoryRunner::new(engine(&player), source, audio_rx);
    let task = tokio::spawn(runner.run());

    // Inside build-2
    tokio::time::sleep(Duration::from_millis(45_000)).await;
    let tx = senders.lock().unwrap()[0].clone();
    tx.send(Ok(Coordinate::new(0.0, 0.0))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    tx.send(Ok(Coordinate::new(0.0, 0.01))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let average = snapshots.borrow_and_update().average_speed;
    assert!(average > 0.0);

    // Gate resolves at 100s; too slow, so failure
    tokio::time::sleep(Duration::from_millis(51_000)).await;
    assert_eq!(snapshots.borrow_and_update().segment, Some(Segment::Failure));
    assert!(tx.is_closed());
    assert!(tx.send(Ok(Coordinate::new(0.0, 1.0))).await.is_err());
    assert_eq!(senders.lock().unwrap().len(), 1);
    assert_eq!(snapshots.borrow().average_speed, average);

    assert_eq!(task.await.unwrap().unwrap(), Outcome::Failure);
}

#[tokio::test(start_paused = true)]
async fn test_standing_still_fails_and_loops_gate_track() {
    init_logging();
    let player = RecordingPlayer::new();
    let (audio_tx, audio_rx) = mpsc::channel(4);
    let source = || {
        let (tx, rx) = mpsc::channel::<PositionReading>(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5000));
            loop {
                ticker.tick().await;
                if tx.send(Ok(Coordinate::new(51.5, -0.12))).await.is_err() {
                    break;
                }
            }
        });
        rx
    };
    let (runner, mut snapshots) = StoryRunner::new(engine(&player), source, audio_rx);
    let task = tokio::spawn(runner.run());

    tokio::time::sleep(Duration::from_millis(70_000)).await;
    {
        let snapshot = snapshots.borrow_and_update();
        assert_eq!(snapshot.segment, Some(Segment::Build2));
        assert_eq!(snapshot.average_speed, 0.0);
    }
    let plays_before = player.log().play_count;
    // A late end from build-1's track is ignored, the gated track loops
    audio_tx
        .send(AudioEvent::Ended {
            track_id: "b".to_string(),
        })
        .await
        .unwrap();
    audio_tx
        .send(AudioEvent::Ended {
            track_id: "c".to_string(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(player.log().play_count, plays_before + 1);
    assert_eq!(player.log().current_track.as_deref(), Some("c"));

    assert_eq!(task.await.unwrap().unwrap(), Outcome::Failure);
    let snapshot = snapshots.borrow();
    assert_eq!(snapshot.outcome, Some(Outcome::Failure));
    assert!(snapshot.finished);
    assert_eq!(player.log().loads, vec!["a", "b", "c", "e"]);
}
