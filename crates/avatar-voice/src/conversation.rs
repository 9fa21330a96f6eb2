//! **AgentConversation**: The duplex WebSocket session with the conversational agent.
//!
//! Outbound: the initiation frame, microphone audio, pongs and tool results. Inbound:
//! transcripts go to the event channel, agent audio goes to the [`SequencerHandle`], and an
//! `interruption` is a barge-in that stops playback on the spot.
//!
//! State: `Disconnected → Connecting → Connected → Disconnecting → Disconnected`. Any close
//! (ours, theirs, or a broken frame) stops the mic uplink, interrupts playback and lands in
//! `Disconnected`.

use crate::audio::{AudioChunk, CaptureGate};
use crate::config::AgentConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::pcm::encode_pcm16_base64;
use crate::protocol::{ClientMessage, ClientToolCall, InitiationData, ServerEvent};
use crate::sequencer::{SequencerHandle, SubmitOutcome};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// How long to wait for the remote to confirm a close before dropping the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// What the conversation reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Initiated {
        conversation_id: String,
        agent_output_audio_format: String,
        user_input_audio_format: String,
    },
    UserTranscript(String),
    AgentResponse(String),
    AgentResponseCorrection(String),
    AgentAudio {
        event_id: u64,
        outcome: SubmitOutcome,
    },
    Interrupted {
        reason: String,
    },
    /// Answer with [`AgentConversation::send_tool_result`].
    ToolCall(ClientToolCall),
    Closed,
}

/// Microphone side of the uplink.
pub struct MicInput {
    pub chunks: mpsc::UnboundedReceiver<AudioChunk>,
    pub gate: CaptureGate,
}

enum Outbound {
    Frame(ClientMessage),
    Close,
}

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct SignedUrl {
    #[serde(alias = "signed_url")]
    url: String,
}

/// Resolve the agent WebSocket URL: an explicit `websocket_url` (with `agent_id` appended
/// as a query parameter), or a signed URL fetched from `signed_url_endpoint`.
pub async fn resolve_agent_url(config: &AgentConfig) -> VoiceResult<String> {
    if let Some(base) = config.websocket_url.as_deref() {
        let mut url = reqwest::Url::parse(base)
            .map_err(|e| VoiceError::Config(format!("agent.websocket_url: {}", e)))?;
        if let Some(agent_id) = config.agent_id.as_deref() {
            url.query_pairs_mut().append_pair("agent_id", agent_id);
        }
        return Ok(url.to_string());
    }

    if let Some(endpoint) = config.signed_url_endpoint.as_deref() {
        let client = reqwest::Client::new();
        let mut request = client.get(endpoint);
        if let Some(agent_id) = config.agent_id.as_deref() {
            request = request.query(&[("agent_id", agent_id)]);
        }
        if let Some(key) = config.api_key.as_deref() {
            request = request.header("xi-api-key", key);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| VoiceError::Transport(format!("signed url request: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(VoiceError::Transport(format!(
                "signed url endpoint returned {}",
                status
            )));
        }
        let signed: SignedUrl = resp
            .json()
            .await
            .map_err(|e| VoiceError::Transport(format!("signed url response: {}", e)))?;
        return Ok(signed.url);
    }

    Err(VoiceError::Config(
        "agent.websocket_url or agent.signed_url_endpoint is required".to_string(),
    ))
}

/// One conversational agent link. Reconnectable: `connect` again after `Disconnected`.
pub struct AgentConversation {
    sequencer: SequencerHandle,
    initiation: InitiationData,
    mic: Option<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<AudioChunk>>>>,
    gate: CaptureGate,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<ConversationEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
}

impl AgentConversation {
    /// Create a disconnected conversation. Returns it with its event receiver.
    pub fn new(
        sequencer: SequencerHandle,
        mic: Option<MicInput>,
        initiation: InitiationData,
    ) -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (mic, gate) = match mic {
            Some(MicInput { chunks, gate }) => (Some(Arc::new(tokio::sync::Mutex::new(chunks))), gate),
            None => (None, CaptureGate::default()),
        };
        let conversation = Self {
            sequencer,
            initiation,
            mic,
            gate,
            state_tx: Arc::new(state_tx),
            events_tx,
            outbound: Mutex::new(None),
        };
        (conversation, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Open the socket, send the initiation frame and start the mic uplink.
    /// A no-op while already connecting or connected.
    pub async fn connect(&self, url: &str) -> VoiceResult<()> {
        let entered = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !entered {
            debug!(state = ?self.state(), "AgentConversation: connect ignored");
            return Ok(());
        }

        info!("AgentConversation: connecting");
        let socket = match connect_async(url).await {
            Ok((socket, _response)) => socket,
            Err(e) => {
                warn!("AgentConversation: connect failed: {}", e);
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Outbound::Frame(ClientMessage::initiation(self.initiation.clone())));
        let connected = {
            let mut outbound = self.lock_outbound();
            let connected = self.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
            if connected {
                *outbound = Some(tx.clone());
            }
            connected
        };
        if connected {
            info!("AgentConversation: connected");
        } else {
            // disconnect() ran while the handshake was in flight.
            info!("AgentConversation: close requested while connecting, closing");
            let _ = tx.send(Outbound::Close);
        }

        let session = Session {
            sequencer: self.sequencer.clone(),
            mic: self.mic.clone(),
            gate: self.gate.clone(),
            state_tx: Arc::clone(&self.state_tx),
            events_tx: self.events_tx.clone(),
            self_tx: tx,
        };
        tokio::spawn(session.run(socket, rx));
        Ok(())
    }

    /// Begin a graceful close. The state flips to `Disconnecting` immediately and reaches
    /// `Disconnected` once the remote confirms. While still connecting, the close is sent
    /// as soon as the socket opens.
    pub fn disconnect(&self) {
        let mut outbound = self.lock_outbound();
        let requested = self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                *state = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        });
        match outbound.take() {
            Some(tx) => {
                let _ = tx.send(Outbound::Close);
            }
            None if requested => debug!("AgentConversation: close deferred until the socket opens"),
            None => {}
        }
    }

    /// Resolve once the conversation is `Disconnected`.
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    /// Answer a `client_tool_call`.
    pub fn send_tool_result(&self, tool_call_id: &str, result: &str, is_error: bool) {
        self.send(ClientMessage::tool_result(tool_call_id, result, is_error));
    }

    /// Queue an outbound frame. Dropped unless the socket is open.
    pub fn send(&self, message: ClientMessage) {
        if self.state() != ConnectionState::Connected {
            debug!(kind = message.kind(), "AgentConversation: not connected, dropping frame");
            return;
        }
        if let Some(tx) = self.lock_outbound().as_ref() {
            let _ = tx.send(Outbound::Frame(message));
        }
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything the socket task needs, detached from the `AgentConversation`.
struct Session {
    sequencer: SequencerHandle,
    mic: Option<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<AudioChunk>>>>,
    gate: CaptureGate,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<ConversationEvent>,
    self_tx: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    async fn run(self, socket: AgentSocket, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        let (mut sink, mut stream) = socket.split();

        let mut mic = match self.mic.as_ref() {
            Some(m) => Some(Arc::clone(m).lock_owned().await),
            None => None,
        };
        // Drop anything captured while we were offline.
        if let Some(rx) = mic.as_mut() {
            while rx.try_recv().is_ok() {}
        }
        self.gate.open();

        let mut closing: Option<tokio::time::Instant> = None;
        loop {
            let close_deadline = closing.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match ServerEvent::parse(text.as_str()) {
                            Ok(event) => self.handle_event(event).await,
                            Err(e) => {
                                warn!("AgentConversation: malformed frame, closing: {}", e);
                                if closing.is_none() {
                                    closing = Some(self.begin_close(&mut sink).await);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "AgentConversation: remote closed");
                        let _ = sink.close().await;
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => debug!("AgentConversation: ignoring binary frame"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("AgentConversation: socket error: {}", e);
                        break;
                    }
                    None => break,
                },
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Frame(message)) => {
                        if closing.is_some() {
                            debug!(kind = message.kind(), "AgentConversation: closing, dropping frame");
                            continue;
                        }
                        if let Err(e) = send_frame(&mut sink, &message).await {
                            warn!("AgentConversation: send failed: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        if closing.is_none() {
                            closing = Some(self.begin_close(&mut sink).await);
                        }
                    }
                    None => break,
                },
                chunk = recv_mic(&mut mic), if mic.is_some() && closing.is_none() => match chunk {
                    Some(chunk) => {
                        let message = ClientMessage::user_audio(encode_pcm16_base64(&chunk.samples));
                        if let Err(e) = send_frame(&mut sink, &message).await {
                            warn!("AgentConversation: send failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        debug!("AgentConversation: microphone ended");
                        mic = None;
                    }
                },
                _ = tokio::time::sleep_until(close_deadline), if closing.is_some() => {
                    warn!("AgentConversation: remote did not confirm close");
                    break;
                }
            }
        }

        self.gate.close();
        drop(mic);
        if let Err(e) = self.sequencer.interrupt() {
            debug!("AgentConversation: sequencer already gone: {}", e);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        let _ = self.events_tx.send(ConversationEvent::Closed);
        info!("AgentConversation: disconnected");
    }

    /// Stop the uplink, mark `Disconnecting` and send our close frame.
    async fn begin_close(
        &self,
        sink: &mut futures::stream::SplitSink<AgentSocket, Message>,
    ) -> tokio::time::Instant {
        self.gate.close();
        self.state_tx.send_replace(ConnectionState::Disconnecting);
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("AgentConversation: close frame not sent: {}", e);
        }
        tokio::time::Instant::now() + CLOSE_TIMEOUT
    }

    async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::ConversationInitiationMetadata {
                conversation_initiation_metadata_event: meta,
            } => {
                info!(
                    conversation_id = %meta.conversation_id,
                    output_format = %meta.agent_output_audio_format,
                    "AgentConversation: conversation initiated"
                );
                self.emit(ConversationEvent::Initiated {
                    conversation_id: meta.conversation_id,
                    agent_output_audio_format: meta.agent_output_audio_format,
                    user_input_audio_format: meta.user_input_audio_format,
                });
            }
            ServerEvent::UserTranscript {
                user_transcription_event,
            } => self.emit(ConversationEvent::UserTranscript(
                user_transcription_event.user_transcript,
            )),
            ServerEvent::AgentResponse {
                agent_response_event,
            } => {
                let text = agent_response_event.agent_response;
                self.hint(&text);
                self.emit(ConversationEvent::AgentResponse(text));
            }
            ServerEvent::AgentResponseCorrection {
                agent_response_correction_event,
            } => {
                let text = agent_response_correction_event.corrected_response;
                self.hint(&text);
                self.emit(ConversationEvent::AgentResponseCorrection(text));
            }
            ServerEvent::Audio { audio_event } => {
                let event_id = audio_event.event_id;
                match self
                    .sequencer
                    .submit(Some(event_id.into()), audio_event.audio_base_64)
                    .await
                {
                    Ok(outcome) => self.emit(ConversationEvent::AgentAudio { event_id, outcome }),
                    Err(e) => warn!(event_id, "AgentConversation: sequencer unavailable: {}", e),
                }
            }
            ServerEvent::Interruption { interruption_event } => {
                info!(reason = %interruption_event.reason, "AgentConversation: barge-in");
                if let Err(e) = self.sequencer.interrupt() {
                    warn!("AgentConversation: interrupt failed: {}", e);
                }
                self.emit(ConversationEvent::Interrupted {
                    reason: interruption_event.reason,
                });
            }
            ServerEvent::Ping { ping_event } => {
                let tx = self.self_tx.clone();
                let delay = Duration::from_millis(ping_event.ping_ms.unwrap_or(0));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Outbound::Frame(ClientMessage::pong(ping_event.event_id)));
                });
            }
            ServerEvent::ClientToolCall { client_tool_call } => {
                info!(
                    tool = %client_tool_call.tool_name,
                    id = %client_tool_call.tool_call_id,
                    "AgentConversation: tool call"
                );
                self.emit(ConversationEvent::ToolCall(client_tool_call));
            }
            event if event.is_internal() => debug!(?event, "AgentConversation: internal event"),
            _ => debug!("AgentConversation: ignoring unknown event"),
        }
    }

    /// The agent's words help the annotator pick mouth shapes for its audio.
    fn hint(&self, text: &str) {
        if let Err(e) = self.sequencer.set_dialog_hint(text) {
            debug!("AgentConversation: sequencer already gone: {}", e);
        }
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events_tx.send(event);
    }
}

async fn send_frame(
    sink: &mut futures::stream::SplitSink<AgentSocket, Message>,
    message: &ClientMessage,
) -> VoiceResult<()> {
    let json = message.to_json()?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn recv_mic(
    mic: &mut Option<tokio::sync::OwnedMutexGuard<mpsc::UnboundedReceiver<AudioChunk>>>,
) -> Option<AudioChunk> {
    match mic.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn websocket_url_gets_agent_id() {
        let config = AgentConfig {
            websocket_url: Some("wss://agent.example/v1/convai/conversation".into()),
            agent_id: Some("agent 42".into()),
            ..Default::default()
        };
        let url = resolve_agent_url(&config).await.unwrap();
        assert_eq!(url, "wss://agent.example/v1/convai/conversation?agent_id=agent+42");
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let err = resolve_agent_url(&AgentConfig::default()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
