//! Example: Lip-Synced Playback
//!
//! Annotates a WAV file with the configured backend, then plays it through the sequencer
//! while printing the avatar's mouth shape.
//!
//! ```text
//! cargo run -p avatar-voice --example lipsync_demo -- speech.wav
//! AVATAR__ANNOTATION__BACKEND=rhubarb cargo run -p avatar-voice --example lipsync_demo -- speech.wav
//! ```

use avatar_voice::pcm::{downsample, to_mono};
use avatar_voice::{
    build_annotator, encode_pcm16_base64, AvatarConfig, PlaybackEngine, PlaybackEvent,
    PosePoller, RodioSink, SequencerDriver, SubmitOutcome, AGENT_SAMPLE_RATE,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Split the file into chunks of this many seconds, like an agent streaming its answer.
const CHUNK_SECONDS: f32 = 1.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: lipsync_demo <file.wav>")?;
    let config = AvatarConfig::load()?;

    let mut reader = hound::WavReader::open(&path)?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };
    let mono = to_mono(&samples, spec.channels as usize);
    let audio = downsample(&mono, spec.sample_rate, AGENT_SAMPLE_RATE);
    info!(
        "🎧 {} ({} Hz, {} ch) -> {:.1}s at {} Hz",
        path,
        spec.sample_rate,
        spec.channels,
        audio.len() as f32 / AGENT_SAMPLE_RATE as f32,
        AGENT_SAMPLE_RATE
    );

    let annotator = build_annotator(&config.annotation)?;
    let (engine, mut playback_events) =
        PlaybackEngine::new(Box::new(RodioSink::open_default()?), AGENT_SAMPLE_RATE);
    let engine = Arc::new(engine);
    let (sequencer, pose_state, _driver) =
        SequencerDriver::spawn(config.sequencer.clone(), annotator, Arc::clone(&engine));
    let (mut poses, _poller) =
        PosePoller::spawn(Arc::clone(&engine), pose_state, config.playback.poll_interval());

    let chunk_len = (AGENT_SAMPLE_RATE as f32 * CHUNK_SECONDS) as usize;
    let mut chunks = 0;
    let mut ended = 0;
    for chunk in audio.chunks(chunk_len) {
        let payload = encode_pcm16_base64(chunk);
        // The buffer holds a few seconds; wait for playback to make room.
        while sequencer.submit(Some("demo".into()), payload.clone()).await? == SubmitOutcome::Rejected {
            match playback_events.recv().await {
                Some(PlaybackEvent::Ended { .. }) => ended += 1,
                Some(_) => {}
                None => return Ok(()),
            }
        }
        info!("📦 chunk {} queued", chunks);
        chunks += 1;
    }

    while ended < chunks {
        tokio::select! {
            Some(event) = playback_events.recv() => match event {
                PlaybackEvent::Started { item, duration } => {
                    info!("🔊 item {} started ({:.2}s)", item, duration.as_secs_f32());
                }
                PlaybackEvent::Ended { item, outcome } => {
                    info!("🤫 item {} ended: {:?}", item, outcome);
                    ended += 1;
                }
            },
            Ok(()) = poses.changed() => {
                let pose = *poses.borrow_and_update();
                if pose.is_speaking {
                    info!(
                        "👄 {:>5.2}s {:<10} {:?}",
                        pose.elapsed,
                        pose.viseme.map(|v| v.morph_target()).unwrap_or("-"),
                        pose.animation
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                sequencer.interrupt()?;
                break;
            }
        }
    }

    info!("✅ Done");
    Ok(())
}
