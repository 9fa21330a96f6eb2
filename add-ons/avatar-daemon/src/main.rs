//! Avatar Voice Daemon
//!
//! Connects the microphone to a conversational agent, plays its answers back in order and
//! publishes the lip-sync pose. Runs until Ctrl-C or until the agent closes the session.

use avatar_voice::{
    build_annotator, resolve_agent_url, AgentConversation, AudioCapture, AvatarConfig,
    CaptureGate, ConversationEvent, InitiationData, MicInput, PlaybackEngine, PosePoller,
    RodioSink, SequencerDriver,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for the agent to confirm the close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(6);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[avatar-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AvatarConfig::load()?;
    tracing::info!(
        max_buffer = config.sequencer.max_buffer_size,
        parallel = config.sequencer.parallel_processing_limit,
        gap_policy = ?config.sequencer.gap_policy,
        annotator = ?config.annotation.backend,
        capture = config.capture.enabled,
        "Avatar daemon starting"
    );

    let annotator = build_annotator(&config.annotation)?;
    let sink = RodioSink::open_default()?;
    let (engine, mut playback_events) = PlaybackEngine::new(Box::new(sink), config.playback.sample_rate);
    let engine = Arc::new(engine);

    let (sequencer, pose_state, driver_task) =
        SequencerDriver::spawn(config.sequencer.clone(), annotator, Arc::clone(&engine));
    let (mut poses, poller_task) =
        PosePoller::spawn(Arc::clone(&engine), pose_state, config.playback.poll_interval());

    // The cpal stream must stay on this task and alive until shutdown.
    let (_mic_stream, mic) = if config.capture.enabled {
        let gate = CaptureGate::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = AudioCapture::new(config.capture.clone())?.start_capture(tx, gate.clone())?;
        (Some(stream), Some(MicInput { chunks: rx, gate }))
    } else {
        (None, None)
    };

    let (conversation, mut events) =
        AgentConversation::new(sequencer.clone(), mic, InitiationData::default());
    let url = resolve_agent_url(&config.agent).await?;
    conversation.connect(&url).await?;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ConversationEvent::Initiated { conversation_id, agent_output_audio_format, .. } => {
                    tracing::info!(%conversation_id, format = %agent_output_audio_format, "Conversation started");
                }
                ConversationEvent::UserTranscript(text) => tracing::info!(user = %text, "User said"),
                ConversationEvent::AgentResponse(text) => tracing::info!(agent = %text, "Agent said"),
                ConversationEvent::AgentResponseCorrection(text) => {
                    tracing::info!(agent = %text, "Agent corrected response")
                }
                ConversationEvent::AgentAudio { event_id, outcome } => {
                    tracing::debug!(event_id, ?outcome, "Agent audio chunk")
                }
                ConversationEvent::Interrupted { reason } => tracing::info!(%reason, "Barge-in"),
                ConversationEvent::ToolCall(call) => {
                    tracing::warn!(tool = %call.tool_name, "No client tools registered");
                    conversation.send_tool_result(&call.tool_call_id, "tool not available", true);
                }
                ConversationEvent::Closed => {
                    tracing::info!("Agent closed the conversation");
                    break;
                }
            },
            Some(event) = playback_events.recv() => tracing::debug!(?event, "Playback"),
            Ok(()) = poses.changed() => {
                let pose = *poses.borrow_and_update();
                if pose.is_speaking {
                    tracing::trace!(
                        viseme = ?pose.viseme.map(|v| v.morph_target()),
                        elapsed = pose.elapsed,
                        "Pose"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                conversation.disconnect();
                if tokio::time::timeout(SHUTDOWN_GRACE, conversation.closed()).await.is_err() {
                    tracing::warn!("Conversation did not close in time");
                }
                break;
            }
        }
    }

    drop(conversation);
    drop(sequencer);
    drop(poses);
    if tokio::time::timeout(SHUTDOWN_GRACE, driver_task).await.is_err() {
        tracing::warn!("Sequencer driver still busy at exit");
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, poller_task).await;
    tracing::info!("Avatar daemon stopped");
    Ok(())
}
