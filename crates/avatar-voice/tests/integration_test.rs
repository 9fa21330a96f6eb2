//! Integration tests for the avatar speech pipeline
//!
//! Note: the `#[ignore]` tests require audio devices and may not work in CI environments.

use avatar_voice::{
    AudioCapture, AvatarConfig, CaptureConfig, CaptureGate, PlaceholderAnnotator, PlaybackEngine,
    PlaybackEvent, PlaybackOutcome, PosePoller, RodioSink, SequencerConfig, SequencerDriver,
    SubmitOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// 440 Hz tone at the agent rate, base64 PCM16.
fn tone(seconds: f32) -> String {
    let n = (16000.0 * seconds) as usize;
    let samples: Vec<f32> = (0..n)
        .map(|i| 0.2 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
        .collect();
    avatar_voice::encode_pcm16_base64(&samples)
}

#[tokio::test]
#[ignore] // Ignore by default since it requires an output device
async fn test_speaker_playback_lifecycle() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sink = RodioSink::open_default().expect("Failed to open output device");
    let (engine, mut events) = PlaybackEngine::new(Box::new(sink), 16000);

    let outcome = timeout(Duration::from_secs(3), engine.play(&tone(0.5)))
        .await
        .expect("Playback did not finish");
    let outcome = tokio_test::assert_ok!(outcome);
    assert_eq!(outcome, PlaybackOutcome::Completed);

    assert!(matches!(events.recv().await, Some(PlaybackEvent::Started { .. })));
    assert!(matches!(
        events.recv().await,
        Some(PlaybackEvent::Ended { outcome: PlaybackOutcome::Completed, .. })
    ));
    assert!(!engine.is_playing());
}

#[tokio::test]
#[ignore] // Requires an output device; listen for three beeps with no gaps or reordering
async fn test_sequenced_speaker_output() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sink = RodioSink::open_default().expect("Failed to open output device");
    let (engine, mut events) = PlaybackEngine::new(Box::new(sink), 16000);
    let engine = Arc::new(engine);
    let (sequencer, pose_state, _driver) = SequencerDriver::spawn(
        SequencerConfig::default(),
        Arc::new(PlaceholderAnnotator),
        Arc::clone(&engine),
    );
    let (mut poses, _poller) =
        PosePoller::spawn(Arc::clone(&engine), pose_state, Duration::from_millis(100));

    for _ in 0..3 {
        let outcome = sequencer.submit(Some(1u64.into()), tone(0.4)).await;
        assert!(matches!(outcome, Ok(SubmitOutcome::Accepted { .. })));
    }

    let ended = timeout(Duration::from_secs(5), async {
        let mut ended = 0;
        while let Some(event) = events.recv().await {
            if let PlaybackEvent::Ended { outcome, .. } = event {
                assert_eq!(outcome, PlaybackOutcome::Completed);
                ended += 1;
                if ended == 3 {
                    break;
                }
            }
        }
        ended
    })
    .await
    .expect("Sequenced playback did not finish");
    assert_eq!(ended, 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!poses.borrow_and_update().is_speaking);
}

#[tokio::test]
#[ignore] // Requires a microphone
async fn test_microphone_capture_gate() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let capture = AudioCapture::new(CaptureConfig::default()).expect("No input device");
    let gate = CaptureGate::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _stream = capture
        .start_capture(tx, gate.clone())
        .expect("Failed to start capture");

    // Closed gate: nothing is forwarded.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    gate.open();
    let chunk = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("No audio captured")
        .expect("Capture channel closed");
    assert!(!chunk.samples.is_empty());
}

#[tokio::test]
async fn test_config_validation() {
    // A zero-sized buffer would reject every chunk.
    let mut config = AvatarConfig::default();
    config.sequencer.max_buffer_size = 0;
    assert!(config.validate().is_err(), "Should fail with an empty buffer");

    let mut config = AvatarConfig::default();
    config.sequencer.parallel_processing_limit = 0;
    assert!(config.validate().is_err(), "Should fail with no annotation slots");

    tokio_test::assert_ok!(AvatarConfig::default().validate());
}

#[tokio::test]
async fn test_pipeline_shuts_down_with_last_handle() {
    let sink = Arc::new(avatar_voice::MemorySink::new());
    let (engine, _events) = PlaybackEngine::new(Box::new(Arc::clone(&sink)), 16000);
    let engine = Arc::new(engine);
    let (sequencer, pose_state, driver) = SequencerDriver::spawn(
        SequencerConfig::default(),
        Arc::new(PlaceholderAnnotator),
        Arc::clone(&engine),
    );
    let (poses, poller) =
        PosePoller::spawn(Arc::clone(&engine), pose_state, Duration::from_millis(10));

    sequencer.submit(None, tone(2.0)).await.expect("Submit failed");
    drop(sequencer);
    timeout(Duration::from_secs(2), driver)
        .await
        .expect("Driver did not stop")
        .expect("Driver panicked");
    assert!(!engine.is_playing());

    drop(poses);
    timeout(Duration::from_secs(2), poller)
        .await
        .expect("Poller did not stop")
        .expect("Poller panicked");
}
