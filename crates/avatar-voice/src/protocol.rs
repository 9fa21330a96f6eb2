//! Agent conversation wire frames (JSON text messages over the WebSocket).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InitiationMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: String,
    #[serde(default)]
    pub user_input_audio_format: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserTranscription {
    pub user_transcript: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentResponse {
    pub agent_response: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentResponseCorrection {
    pub corrected_response: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioEvent {
    pub audio_base_64: String,
    /// Groups the chunks of one agent utterance.
    pub event_id: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Interruption {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ping {
    pub event_id: u64,
    /// Delay the server asks for before the pong.
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientToolCall {
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VadScore {
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnProbability {
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TentativeAgentResponse {
    pub tentative_agent_response: String,
}

/// Inbound frames, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    UserTranscript {
        user_transcription_event: UserTranscription,
    },
    AgentResponse {
        agent_response_event: AgentResponse,
    },
    AgentResponseCorrection {
        agent_response_correction_event: AgentResponseCorrection,
    },
    Audio {
        audio_event: AudioEvent,
    },
    Interruption {
        #[serde(default)]
        interruption_event: Interruption,
    },
    Ping {
        ping_event: Ping,
    },
    ClientToolCall {
        client_tool_call: ClientToolCall,
    },
    InternalVadScore {
        vad_event: VadScore,
    },
    InternalTurnProbability {
        turn_event: TurnProbability,
    },
    InternalTentativeAgentResponse {
        tentative_agent_response_internal_event: TentativeAgentResponse,
    },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one text frame. Unknown `type`s parse to [`ServerEvent::Unknown`]; anything
    /// that is not a JSON object with a string `type` is a protocol error.
    pub fn parse(frame: &str) -> VoiceResult<Self> {
        serde_json::from_str(frame).map_err(|e| VoiceError::Protocol(format!("bad frame: {}", e)))
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ServerEvent::InternalVadScore { .. }
                | ServerEvent::InternalTurnProbability { .. }
                | ServerEvent::InternalTentativeAgentResponse { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationConfigOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentOverride>,
}

/// Body of `conversation_initiation_client_data`. Everything is optional; the default is
/// an empty initiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InitiationData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_config_override: Option<ConversationConfigOverride>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub dynamic_variables: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedClientMessage {
    ConversationInitiationClientData(InitiationData),
    Pong {
        event_id: u64,
    },
    ClientToolResult {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
}

/// Outbound frames. Microphone audio is the one untyped frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    UserAudioChunk { user_audio_chunk: String },
    Typed(TypedClientMessage),
}

impl ClientMessage {
    pub fn user_audio(audio_base64: String) -> Self {
        ClientMessage::UserAudioChunk {
            user_audio_chunk: audio_base64,
        }
    }

    pub fn initiation(data: InitiationData) -> Self {
        ClientMessage::Typed(TypedClientMessage::ConversationInitiationClientData(data))
    }

    pub fn pong(event_id: u64) -> Self {
        ClientMessage::Typed(TypedClientMessage::Pong { event_id })
    }

    pub fn tool_result(tool_call_id: impl Into<String>, result: impl Into<String>, is_error: bool) -> Self {
        ClientMessage::Typed(TypedClientMessage::ClientToolResult {
            tool_call_id: tool_call_id.into(),
            result: result.into(),
            is_error,
        })
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logs; audio frames are never logged in full.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::UserAudioChunk { .. } => "user_audio_chunk",
            ClientMessage::Typed(TypedClientMessage::ConversationInitiationClientData(_)) => {
                "conversation_initiation_client_data"
            }
            ClientMessage::Typed(TypedClientMessage::Pong { .. }) => "pong",
            ClientMessage::Typed(TypedClientMessage::ClientToolResult { .. }) => "client_tool_result",
        }
    }
}
