//! # Realtime Channel
//!
//! Bidirectional link to the conversational service over a WebSocket.
//!
//! ## Protocol:
//! 1. **Connect**: `wss://{endpoint}?key={api_key}`
//! 2. **Setup**: First client message is `{"setup": {...}}` with model, voice,
//!    response modality and the optional system instruction
//! 3. **Ready**: The server answers `{"setupComplete": {}}`; only then is the
//!    channel reported as opened
//! 4. **Streaming**: Microphone frames go out as
//!    `{"realtimeInput": {"mediaChunks": [{"mimeType", "data"}]}}`
//! 5. **Replies**: `{"serverContent": {...}}` carries base64 PCM in
//!    `modelTurn.parts[].inlineData` and an `interrupted` flag on barge-in
//!
//! ## Rust Concepts Used:
//! - **Trait objects**: The session talks to `dyn RealtimeChannel`, so tests
//!   swap in an in-memory channel
//! - **Task + mpsc**: The socket is owned by one spawned task; callers only
//!   hold a sender, so `send_realtime_input` never blocks

use crate::audio::codec::EncodedBlob;
use crate::error::{AppError, AppResult};
use crate::events::{EventSender, SessionEvent};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Identifies one connection attempt. A reset opens a new connection with a
/// new id, and events still arriving from the old one are ignored.
pub type ConnectionId = u64;

/// What a connection reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Setup acknowledged, ready for audio
    Opened,
    /// Reply content from the service
    Message(InboundPayload),
    /// Transport or protocol failure
    Error(String),
    /// Connection ended, with the reason if one was given
    Closed(String),
}

/// The parts of a server message the session acts on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundPayload {
    /// Base64-encoded 16-bit PCM chunks, in message order
    pub audio_data: Vec<String>,
    /// The user started talking over the reply
    pub interrupted: bool,
}

impl InboundPayload {
    pub fn is_empty(&self) -> bool {
        self.audio_data.is_empty() && !self.interrupted
    }
}

/// Parameters for establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub model: String,
    pub response_modality: String,
    pub voice: String,
    pub system_instruction: Option<String>,
}

/// An open (or opening) connection.
pub trait RealtimeChannel: Send + Sync {
    /// Queue one encoded microphone frame for sending.
    fn send_realtime_input(&self, blob: EncodedBlob) -> AppResult<()>;

    /// Close the connection. Further sends fail; calling again is a no-op.
    fn close(&mut self);
}

/// Opens connections. Lifecycle events are delivered asynchronously on
/// `events`, tagged with `connection`.
pub trait RealtimeConnector: Send {
    fn connect(
        &mut self,
        request: &SessionRequest,
        connection: ConnectionId,
        events: EventSender,
    ) -> AppResult<Box<dyn RealtimeChannel>>;
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<InstructionContent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct InstructionContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<EncodedBlob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Serialize the opening `setup` message.
fn setup_message(request: &SessionRequest) -> AppResult<String> {
    let setup = Setup {
        model: request.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec![request.response_modality.clone()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: request.voice.clone(),
                    },
                },
            },
        },
        system_instruction: request.system_instruction.as_ref().map(|text| InstructionContent {
            parts: vec![TextPart { text: text.clone() }],
        }),
    };
    Ok(serde_json::to_string(&ClientMessage::Setup(setup))?)
}

/// Serialize one outbound audio frame.
fn realtime_input_message(blob: EncodedBlob) -> AppResult<String> {
    let input = RealtimeInput {
        media_chunks: vec![blob],
    };
    Ok(serde_json::to_string(&ClientMessage::RealtimeInput(input))?)
}

/// Turn one raw server message into the events the session cares about.
///
/// Unknown message kinds yield no events.
fn interpret_server_message(raw: &[u8]) -> AppResult<Vec<ChannelEvent>> {
    let message: ServerMessage = serde_json::from_slice(raw)?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(ChannelEvent::Opened);
    }

    if let Some(content) = message.server_content {
        let audio_data = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|inline| inline.mime_type.is_empty() || inline.mime_type.starts_with("audio/"))
                    .map(|inline| inline.data)
                    .collect()
            })
            .unwrap_or_default();
        if content.turn_complete {
            debug!("Model turn complete");
        }

        let payload = InboundPayload {
            audio_data,
            interrupted: content.interrupted,
        };
        if !payload.is_empty() {
            events.push(ChannelEvent::Message(payload));
        }
    }

    if let Some(go_away) = message.go_away {
        warn!(time_left = ?go_away.time_left, "Service announced it will close the connection");
    }

    Ok(events)
}

// ============================================================================
// WebSocket implementation
// ============================================================================

enum Outbound {
    Media(EncodedBlob),
    Close,
}

/// Connects to the live API endpoint with an API key.
pub struct WebSocketConnector {
    endpoint: String,
    api_key: String,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

impl RealtimeConnector for WebSocketConnector {
    fn connect(
        &mut self,
        request: &SessionRequest,
        connection: ConnectionId,
        events: EventSender,
    ) -> AppResult<Box<dyn RealtimeChannel>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Channel(format!("no async runtime: {}", e)))?;
        let setup = setup_message(request)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        info!(connection, endpoint = %self.endpoint, model = %request.model, "Opening realtime channel");
        runtime.spawn(run_connection(self.url(), setup, outbound_rx, connection, events));

        Ok(Box::new(WebSocketChannel {
            outbound: Some(outbound_tx),
        }))
    }
}

/// Handle to a connection task.
struct WebSocketChannel {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl RealtimeChannel for WebSocketChannel {
    fn send_realtime_input(&self, blob: EncodedBlob) -> AppResult<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| AppError::Channel("channel is closed".to_string()))?;
        outbound
            .send(Outbound::Media(blob))
            .map_err(|_| AppError::Channel("connection task has stopped".to_string()))
    }

    fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connection task: owns the socket until either side closes it.
async fn run_connection(
    url: String,
    setup: String,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    connection: ConnectionId,
    events: EventSender,
) {
    let event = match drive_connection(&url, setup, outbound, connection, &events).await {
        Ok(reason) => {
            info!(connection, reason = %reason, "Realtime channel closed");
            ChannelEvent::Closed(reason)
        }
        Err(e) => {
            warn!(connection, error = %e, "Realtime channel failed");
            ChannelEvent::Error(e.to_string())
        }
    };
    let _ = events.send(SessionEvent::Channel { connection, event });
}

async fn drive_connection(
    url: &str,
    setup: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection: ConnectionId,
    events: &EventSender,
) -> AppResult<String> {
    let (socket, _) = connect_async(url).await?;
    let (mut write, mut read) = socket.split();
    write.send(Message::Text(setup)).await?;
    debug!(connection, "Setup sent, waiting for acknowledgement");

    let deliver = |raw: &[u8]| match interpret_server_message(raw) {
        Ok(batch) => {
            for event in batch {
                let _ = events.send(SessionEvent::Channel { connection, event });
            }
        }
        Err(e) => warn!(connection, error = %e, "Ignoring unparseable server message"),
    };

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Media(blob)) => {
                    write.send(Message::Text(realtime_input_message(blob)?)).await?;
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok("closed by client".to_string());
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => deliver(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => deliver(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Ok(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok("connection ended".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn request(instruction: Option<&str>) -> SessionRequest {
        SessionRequest {
            model: "models/test-model".to_string(),
            response_modality: "AUDIO".to_string(),
            voice: "Orus".to_string(),
            system_instruction: instruction.map(str::to_string),
        }
    }

    #[test]
    fn test_setup_message_shape() {
        let raw = setup_message(&request(Some("Be brief."))).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test-model",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Orus"}}
                        }
                    },
                    "systemInstruction": {"parts": [{"text": "Be brief."}]}
                }
            })
        );
    }

    #[test]
    fn test_setup_without_instruction_omits_field() {
        let raw = setup_message(&request(None)).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_realtime_input_shape() {
        let blob = EncodedBlob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAA=".to_string(),
        };
        let value: Value = serde_json::from_str(&realtime_input_message(blob).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAA="}]}})
        );
    }

    #[test]
    fn test_setup_complete_opens() {
        let events = interpret_server_message(br#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(events, vec![ChannelEvent::Opened]);
    }

    #[test]
    fn test_audio_parts_are_collected_in_order() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}},
                    {"text": "ignored"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AgA="}}
                ]}
            }
        })
        .to_string();

        let events = interpret_server_message(raw.as_bytes()).unwrap();
        assert_eq!(
            events,
            vec![ChannelEvent::Message(InboundPayload {
                audio_data: vec!["AQA=".to_string(), "AgA=".to_string()],
                interrupted: false,
            })]
        );
    }

    #[test]
    fn test_interrupted_flag() {
        let events =
            interpret_server_message(br#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(
            events,
            vec![ChannelEvent::Message(InboundPayload {
                audio_data: vec![],
                interrupted: true,
            })]
        );
    }

    #[test]
    fn test_turn_complete_alone_produces_nothing() {
        let events =
            interpret_server_message(br#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert!(events.is_empty());
        assert!(interpret_server_message(br#"{"goAway": {"timeLeft": "5s"}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        let err = interpret_server_message(b"not json").unwrap_err();
        assert!(matches!(err, AppError::Channel(_)));
    }

    #[test]
    fn test_closed_channel_refuses_sends() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channel = WebSocketChannel { outbound: Some(tx) };
        let blob = EncodedBlob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: String::new(),
        };
        assert!(channel.send_realtime_input(blob.clone()).is_ok());

        channel.close();
        channel.close();
        assert!(channel.send_realtime_input(blob.clone()).is_err());
        drop(rx);
    }

    #[test]
    fn test_send_fails_once_task_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let channel = WebSocketChannel { outbound: Some(tx) };
        let blob = EncodedBlob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: String::new(),
        };
        assert!(channel.send_realtime_input(blob).is_err());
    }

    #[test]
    fn test_connect_requires_runtime() {
        let (events, _rx) = crate::events::event_queue();
        let mut connector = WebSocketConnector::new("wss://example.invalid/ws", "key");
        assert!(connector.connect(&request(None), 1, events).is_err());
        assert_eq!(connector.url(), "wss://example.invalid/ws?key=key");
    }
}
