use serde::{Deserialize, Serialize};

use super::models::{
    AudioTranscriptionConfig, Blob, Content, FunctionResponse, GenerationConfig, ToolDeclarations,
};

/// Client -> server messages. Each serializes as `{"<kind>": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Box<Setup>),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    #[must_use]
    pub fn audio(blob: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput { audio: Some(blob), video: None })
    }

    #[must_use]
    pub fn video(blob: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput { audio: None, video: Some(blob) })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::RealtimeInput(_) => "realtimeInput",
            Self::ToolResponse(_) => "toolResponse",
        }
    }
}

/// First message on a new connection: model, tool schema and instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

/// Streamed media. Exactly one of the fields is set per message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

impl RealtimeInput {
    pub fn blobs(&self) -> impl Iterator<Item = &Blob> {
        self.audio.iter().chain(self.video.iter())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}
