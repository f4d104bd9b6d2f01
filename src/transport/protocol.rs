//! Live API wire codec
//!
//! JSON messages exchanged over the WebSocket. Outbound: one `setup` message,
//! then `realtimeInput` audio chunks. Inbound messages are flattened into
//! [`TransportEvent`]s in the order the session should observe them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::{FailureKind, TransportEvent, TransportFailure};
use crate::config::LiveConfig;
use crate::voice::EncodedFrame;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: [Blob; 1],
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

/// Encode the session setup message
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_setup(config: &LiveConfig) -> Result<String> {
    let system_instruction = (!config.system_instruction.is_empty()).then(|| Content {
        parts: [TextPart {
            text: &config.system_instruction,
        }],
    });

    let message = ClientMessage {
        setup: Some(Setup {
            model: &config.model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &config.voice,
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: config.input_transcription.then_some(Empty {}),
            output_audio_transcription: config.output_transcription.then_some(Empty {}),
        }),
        realtime_input: None,
    };

    Ok(serde_json::to_string(&message)?)
}

/// Encode one capture frame as a realtime input message
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_frame(frame: &EncodedFrame) -> Result<String> {
    let message = ClientMessage {
        setup: None,
        realtime_input: Some(RealtimeInput {
            media_chunks: [Blob {
                mime_type: frame.format.mime_type(),
                data: BASE64.encode(&frame.payload),
            }],
        }),
    };

    Ok(serde_json::to_string(&message)?)
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
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<Blob>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Decode one server message into session events
///
/// Unknown message kinds decode to no events. Non-audio inline parts are
/// skipped.
///
/// # Errors
///
/// Returns `Error::Protocol` if the message is not valid JSON or carries
/// undecodable audio
pub fn decode_server_message(raw: &[u8]) -> Result<Vec<TransportEvent>> {
    let message: ServerMessage =
        serde_json::from_slice(raw).map_err(|e| Error::Protocol(e.to_string()))?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Opened);
    }

    if let Some(content) = message.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(TransportEvent::InputTranscription(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(TransportEvent::OutputTranscription(t.text));
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        for blob in content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .filter_map(|part| part.inline_data)
            .filter(|blob| blob.mime_type.starts_with("audio/pcm"))
        {
            let pcm = BASE64
                .decode(blob.data.as_bytes())
                .map_err(|e| Error::Protocol(format!("invalid audio payload: {e}")))?;
            events.push(TransportEvent::AudioFragment(pcm));
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        let detail = go_away
            .time_left
            .map_or_else(|| "server going away".to_string(), |t| format!("server going away in {t}"));
        events.push(TransportEvent::Errored(TransportFailure::new(
            FailureKind::GoingAway,
            detail,
        )));
    }

    Ok(events)
}
