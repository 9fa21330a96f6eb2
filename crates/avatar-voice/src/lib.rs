//! # Avatar Voice - Lip-Synced Agent Speech
//!
//! This crate turns a streaming conversational agent's audio into gap-free, in-order
//! playback with time-aligned mouth shapes for a talking 3D avatar, and keeps it
//! interruptible when the user talks over the agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  user_audio_chunk  ┌──────────────────────┐
//! │  Audio In    │ ─────────────────► │ AgentConversation    │ ◄──► remote agent (WebSocket)
//! │   (cpal)     │                    │ (ping/pong, events)  │
//! └──────────────┘                    └──────────┬───────────┘
//!                                  audio chunks  │  interruption (barge-in)
//!                                                ▼
//!       ┌───────────────────┐ annotate ┌──────────────────────┐
//!       │ MouthCueAnnotator │ ◄──────► │   ChunkSequencer     │
//!       │ (http / rhubarb)  │          │ reorder + buffering  │
//!       └───────────────────┘          └──────────┬───────────┘
//!                                       in order  │  pose state
//!                                                 ▼
//!                       ┌──────────────────┐  cursor  ┌─────────────┐
//!                       │ PlaybackEngine   │ ───────► │ PosePoller  │ ──► renderer
//!                       │ (rodio, clocked) │          │ (viseme)    │
//!                       └──────────────────┘          └─────────────┘
//! ```

pub mod annotation;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod pcm;
pub mod playback;
pub mod pose;
pub mod protocol;
pub mod sequencer;

pub use annotation::{
    build_annotator, parse_mouth_cues, HttpAnnotator, MouthCue, MouthCueAnnotator, MouthCues,
    PlaceholderAnnotator, RhubarbAnnotator,
};
pub use audio::{AudioCapture, AudioChunk, CaptureGate};
pub use config::{
    AgentConfig, AnnotationBackend, AnnotationConfig, AvatarConfig, CaptureConfig, GapPolicy,
    PlaybackConfig, SequencerConfig,
};
pub use conversation::{
    resolve_agent_url, AgentConversation, ConnectionState, ConversationEvent, MicInput,
};
pub use error::{VoiceError, VoiceResult};
pub use pcm::{decode_base64_pcm16, encode_pcm16_base64, PcmBuffer, AGENT_SAMPLE_RATE};
pub use playback::{
    AudioSink, ClockedSource, MemorySink, PlaybackEngine, PlaybackEvent, PlaybackOutcome,
    RodioSink,
};
pub use pose::{project, Animation, FacialExpression, Pose, PosePoller, PoseState, Viseme};
pub use protocol::{ClientMessage, InitiationData, ServerEvent};
pub use sequencer::{
    ChunkSequencer, SequencerAction, SequencerDriver, SequencerHandle, SequencerInput,
    SequencerSnapshot, SessionId, Step, SubmitOutcome, Ticket, Timer,
};
