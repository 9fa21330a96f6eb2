//! Runtime configuration for the avatar voice pipeline.
//!
//! Loaded from defaults, then an optional TOML file, then `AVATAR__*` environment
//! variables (double underscore separates sections, e.g. `AVATAR__SEQUENCER__GAP_POLICY`).

use crate::error::{VoiceError, VoiceResult};
use crate::pcm::AGENT_SAMPLE_RATE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the sequencer does when a chunk's annotation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Never advance past a failed sequence number; later chunks wait for a session reset.
    #[default]
    Stall,
    /// Treat a failed sequence number as played so later chunks can release.
    SkipDropped,
}

/// Chunk sequencer limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Maximum number of annotated chunks waiting to play; later chunks are dropped (default: 5)
    pub max_buffer_size: usize,
    /// Maximum number of chunks awaiting annotation at once (default: 2)
    pub parallel_processing_limit: usize,
    /// Oldest ready chunk is released after waiting this long (default: 1000ms)
    pub buffer_window_ms: u64,
    /// First chunk of a session plays alone if no second chunk is ready by then (default: 500ms)
    pub first_chunk_timeout_ms: u64,
    pub gap_policy: GapPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 5,
            parallel_processing_limit: 2,
            buffer_window_ms: 1000,
            first_chunk_timeout_ms: 500,
            gap_policy: GapPolicy::Stall,
        }
    }
}

impl SequencerConfig {
    pub fn buffer_window(&self) -> Duration {
        Duration::from_millis(self.buffer_window_ms)
    }

    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output sample rate of agent audio. Agent audio and mouth cues are both timed at
    /// 16000 Hz, so no other value is accepted.
    pub sample_rate: u32,
    /// Cadence at which the playback cursor is sampled for lip sync (default: 100ms)
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: AGENT_SAMPLE_RATE,
            poll_interval_ms: 100,
        }
    }
}

impl PlaybackConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which mouth-cue annotator to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationBackend {
    #[default]
    Http,
    Rhubarb,
    Placeholder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub backend: AnnotationBackend,
    /// Lip-sync endpoint for the HTTP backend.
    pub url: String,
    pub timeout_secs: u64,
    /// Path to the Rhubarb Lip Sync executable.
    pub rhubarb_path: String,
    /// Rhubarb recognizer: `phonetic` (fast) or `pocketSphinx` (English, slower).
    pub recognizer: String,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            backend: AnnotationBackend::Http,
            url: "http://127.0.0.1:3000/api/lip-sync".to_string(),
            timeout_secs: 30,
            rhubarb_path: "rhubarb".to_string(),
            recognizer: "phonetic".to_string(),
        }
    }
}

/// Where and how to reach the conversational agent.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent WebSocket URL; `agent_id` is appended as a query parameter when set.
    pub websocket_url: Option<String>,
    pub agent_id: Option<String>,
    /// HTTP endpoint returning `{ "url": "<signed websocket url>" }`.
    pub signed_url_endpoint: Option<String>,
    /// Sent as `xi-api-key` when fetching a signed URL.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("websocket_url", &self.websocket_url)
            .field("agent_id", &self.agent_id)
            .field("signed_url_endpoint", &self.signed_url_endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Stream the microphone to the agent (default: true)
    pub enabled: bool,
    /// Uplink chunk length (default: 250ms)
    pub chunk_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_ms: 250,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub sequencer: SequencerConfig,
    pub playback: PlaybackConfig,
    pub annotation: AnnotationConfig,
    pub agent: AgentConfig,
    pub capture: CaptureConfig,
}

impl AvatarConfig {
    /// Load config from file and environment. Precedence: `AVATAR__*` env > file named by
    /// `AVATAR_CONFIG` (default `config/avatar.toml`) > built-in defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("AVATAR_CONFIG").unwrap_or_else(|_| "config/avatar.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load with an explicit file path (missing file is not an error).
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let built = builder
            .add_source(
                config::Environment::with_prefix("AVATAR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject limits that would wedge the pipeline.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sequencer.max_buffer_size == 0 {
            return Err(VoiceError::Config("sequencer.max_buffer_size must be > 0".into()));
        }
        if self.sequencer.parallel_processing_limit == 0 {
            return Err(VoiceError::Config(
                "sequencer.parallel_processing_limit must be > 0".into(),
            ));
        }
        if self.playback.sample_rate != AGENT_SAMPLE_RATE {
            return Err(VoiceError::Config(format!(
                "playback.sample_rate must be {} (got {})",
                AGENT_SAMPLE_RATE, self.playback.sample_rate
            )));
        }
        if self.playback.poll_interval_ms == 0 {
            return Err(VoiceError::Config("playback.poll_interval_ms must be > 0".into()));
        }
        if self.capture.enabled && self.capture.chunk_ms == 0 {
            return Err(VoiceError::Config("capture.chunk_ms must be > 0".into()));
        }
        Ok(())
    }
}
