//! Live streaming transport.
//!
//! WebSocket client for the bidirectional generateContent endpoint. The
//! connection is split into a writer task fed by a fire-and-forget channel
//! and a reader task that turns server frames into [`LiveEvent`]s for the
//! session driver. Malformed frames are logged and dropped; they never end
//! the session.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

pub const AUDIO_MIME: &str = "audio/pcm;rate=16000";
pub const JPEG_MIME: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Configuration for one live connection.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub voice: Option<String>,
}

impl LiveConfig {
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
                api_key
            ),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            system_instruction: None,
            voice: Some("Kore".to_string()),
        }
    }
}

/// Generation configuration sent in the setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// One outbound media payload: encoded audio or a JPEG still.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

/// Inbound server content relevant to the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveMessage {
    /// Base64 envelope of synthesized speech, when present.
    pub audio: Option<String>,
    /// The user spoke over the model; queued audio must be cancelled.
    pub interrupted: bool,
    pub turn_complete: bool,
}

#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// Setup handshake completed; the stream is ready for realtime input.
    Opened,
    Message(LiveMessage),
    Closed,
    Error(String),
}

enum WriterMsg {
    Text(String),
    Close,
}

/// Handle to an established live connection. Dropping it (or calling
/// [`LiveClient::close`]) shuts the socket down.
pub struct LiveClient {
    writer_tx: mpsc::UnboundedSender<WriterMsg>,
}

impl LiveClient {
    /// Connect, send the setup message, and spawn the reader/writer tasks.
    /// Events are delivered through `events` from this point on.
    pub async fn connect(cfg: LiveConfig, events: mpsc::Sender<LiveEvent>) -> Result<Self> {
        info!("connecting to live endpoint");
        let (ws, _resp) = connect_async(&cfg.url).await?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::text(setup_message(&cfg)?)).await?;

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterMsg>();
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                match msg {
                    WriterMsg::Text(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!("outbound send failed: {}", e);
                            break;
                        }
                    }
                    WriterMsg::Close => break,
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if !dispatch_server_text(&text, &events).await {
                            return;
                        }
                    }
                    // The endpoint also delivers JSON in binary frames.
                    Ok(Message::Binary(bytes)) => {
                        if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                            if !dispatch_server_text(&text, &events).await {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("live connection closed: {:?}", frame);
                        let _ = events.send(LiveEvent::Closed).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(LiveEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
            let _ = events.send(LiveEvent::Closed).await;
        });

        Ok(Self { writer_tx })
    }

    /// Fire-and-forget realtime send. A send after close is silently
    /// discarded.
    pub fn send_realtime(&self, chunk: MediaChunk) {
        match realtime_message(&chunk) {
            Ok(text) => {
                let _ = self.writer_tx.send(WriterMsg::Text(text));
            }
            Err(e) => warn!("failed to serialize realtime input: {}", e),
        }
    }

    pub fn close(&self) {
        let _ = self.writer_tx.send(WriterMsg::Close);
    }
}

fn setup_message(cfg: &LiveConfig) -> Result<String> {
    let mut generation_config = GenerationConfig {
        response_modalities: vec!["AUDIO".to_string()],
        speech_config: None,
    };
    if let Some(voice) = &cfg.voice {
        generation_config.speech_config = Some(json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        }));
    }

    let setup = Setup {
        model: cfg.model.clone(),
        generation_config: Some(generation_config),
        system_instruction: cfg.system_instruction.clone(),
    };

    Ok(format!("{{\"setup\":{}}}", serde_json::to_string(&setup)?))
}

fn realtime_message(chunk: &MediaChunk) -> Result<String> {
    let field = if chunk.mime_type.starts_with("image/") {
        "video"
    } else {
        "audio"
    };
    Ok(format!(
        "{{\"realtimeInput\":{{\"{}\":{}}}}}",
        field,
        serde_json::to_string(chunk)?
    ))
}

#[derive(Debug, PartialEq)]
enum ParsedServer {
    SetupComplete,
    Content(LiveMessage),
    GoAway,
}

fn parse_server_text(text: &str) -> Result<Option<ParsedServer>> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if value.get("setupComplete").is_some() {
        return Ok(Some(ParsedServer::SetupComplete));
    }
    if value.get("goAway").is_some() {
        return Ok(Some(ParsedServer::GoAway));
    }
    if let Some(content) = value.get("serverContent") {
        let mut msg = LiveMessage {
            interrupted: content
                .get("interrupted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            turn_complete: content
                .get("turnComplete")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            audio: None,
        };
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(|p| p.as_array()) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(|d| d.as_str()) {
                    msg.audio = Some(data.to_string());
                    break;
                }
            }
        }
        return Ok(Some(ParsedServer::Content(msg)));
    }

    Ok(None)
}

/// Returns false when the reader task should stop.
async fn dispatch_server_text(text: &str, events: &mpsc::Sender<LiveEvent>) -> bool {
    match parse_server_text(text) {
        Ok(Some(ParsedServer::SetupComplete)) => {
            events.send(LiveEvent::Opened).await.is_ok()
        }
        Ok(Some(ParsedServer::Content(msg))) => {
            events.send(LiveEvent::Message(msg)).await.is_ok()
        }
        Ok(Some(ParsedServer::GoAway)) => {
            info!("server requested disconnection");
            let _ = events.send(LiveEvent::Closed).await;
            false
        }
        Ok(None) => {
            debug!("ignoring unhandled server message");
            true
        }
        Err(e) => {
            warn!("dropping unparseable server frame: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_carries_model_and_voice() {
        let cfg = LiveConfig {
            url: String::new(),
            model: "models/test-live".to_string(),
            system_instruction: Some("Be patient.".to_string()),
            voice: Some("Kore".to_string()),
        };

        let text = setup_message(&cfg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed["setup"]["model"], "models/test-live");
        assert_eq!(parsed["setup"]["systemInstruction"], "Be patient.");
        assert_eq!(parsed["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            parsed["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
    }

    #[test]
    fn audio_chunks_go_under_the_audio_field() {
        let chunk = MediaChunk {
            data: "cGNt".to_string(),
            mime_type: AUDIO_MIME.to_string(),
        };

        let text = realtime_message(&chunk).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed["realtimeInput"]["audio"]["data"], "cGNt");
        assert_eq!(parsed["realtimeInput"]["audio"]["mimeType"], AUDIO_MIME);
        assert!(parsed["realtimeInput"].get("video").is_none());
    }

    #[test]
    fn stills_go_under_the_video_field() {
        let chunk = MediaChunk {
            data: "anBn".to_string(),
            mime_type: JPEG_MIME.to_string(),
        };

        let text = realtime_message(&chunk).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed["realtimeInput"]["video"]["mimeType"], JPEG_MIME);
        assert!(parsed["realtimeInput"].get("audio").is_none());
    }

    #[test]
    fn parses_setup_complete() {
        let msg = json!({"setupComplete": {}}).to_string();
        assert_eq!(
            parse_server_text(&msg).unwrap(),
            Some(ParsedServer::SetupComplete)
        );
    }

    #[test]
    fn parses_audio_content_with_flags() {
        let msg = json!({
            "serverContent": {
                "modelTurn": { "parts": [ { "inlineData": { "data": "YmFzZTY0", "mimeType": "audio/pcm;rate=24000" } } ] },
                "turnComplete": true
            }
        })
        .to_string();

        match parse_server_text(&msg).unwrap() {
            Some(ParsedServer::Content(content)) => {
                assert_eq!(content.audio.as_deref(), Some("YmFzZTY0"));
                assert!(content.turn_complete);
                assert!(!content.interrupted);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_interruption_without_audio() {
        let msg = json!({"serverContent": {"interrupted": true}}).to_string();

        match parse_server_text(&msg).unwrap() {
            Some(ParsedServer::Content(content)) => {
                assert!(content.interrupted);
                assert!(content.audio.is_none());
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn unknown_messages_are_ignored_and_garbage_is_an_error() {
        let msg = json!({"toolCall": {"id": "1"}}).to_string();
        assert_eq!(parse_server_text(&msg).unwrap(), None);
        assert!(parse_server_text("{not json").is_err());
    }
}
