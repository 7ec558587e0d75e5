use crate::Result;
use crate::protocol::client_messages::Setup;
use crate::protocol::models::{
    AudioTranscriptionConfig, Content, DEFAULT_MODEL, GenerationConfig, Modality, SpeechConfig,
};
use crate::providers::Capabilities;
use std::sync::Arc;
use std::time::Duration;

use super::capture::AudioInput;
use super::handlers::EventHandlers;
use super::playback::{AudioSink, SoftwareSink};
use super::session::{LiveSession, SessionParts};
use super::tools::ToolRegistry;
use super::transport::{Connector, WsConnector};
use super::wake::WakeTrigger;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const DEFAULT_INSTRUCTION: &str = "You are a helpful voice assistant. Keep answers short and conversational. \
You can list, read and write files in the folder the user connected, schedule, list and delete reminders, \
search the web and open web pages. Use the tools when they help, and tell the user what you did.";

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per captured audio frame.
    pub frame_samples: usize,
    pub video_interval: Duration,
    /// Linear downscale applied to camera frames.
    pub video_scale: f32,
    pub jpeg_quality: u8,
    pub volume_interval: Duration,
    pub connect_timeout: Duration,
    /// Buffered [`super::SessionEvent`]s before new ones are dropped.
    pub event_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 4096,
            video_interval: Duration::from_millis(500),
            video_scale: 0.25,
            jpeg_quality: 50,
            volume_interval: Duration::from_millis(16),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

pub struct Live;

impl Live {
    #[must_use]
    pub fn builder() -> LiveBuilder {
        LiveBuilder::new()
    }
}

pub struct LiveBuilder {
    api_key: Option<String>,
    model: Option<String>,
    voice: Option<String>,
    instruction: Option<String>,
    endpoint: Option<String>,
    audio_input: Option<Arc<dyn AudioInput>>,
    audio_output: Option<Box<dyn AudioSink>>,
    capabilities: Option<Capabilities>,
    tools: Option<ToolRegistry>,
    handlers: EventHandlers,
    wake: Option<WakeTrigger>,
    connector: Option<Arc<dyn Connector>>,
    config: LiveConfig,
}

impl LiveBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_key: None,
            model: None,
            voice: None,
            instruction: None,
            endpoint: None,
            audio_input: None,
            audio_output: None,
            capabilities: None,
            tools: None,
            handlers: EventHandlers::new(),
            wake: None,
            connector: None,
            config: LiveConfig::default(),
        }
    }

    /// Builder with the API key taken from `GEMINI_API_KEY`, if set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        builder.api_key = std::env::var(API_KEY_ENV).ok().filter(|key| !key.trim().is_empty());
        builder
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn audio_input(mut self, input: impl AudioInput + 'static) -> Self {
        self.audio_input = Some(Arc::new(input));
        self
    }

    #[must_use]
    pub fn audio_output(mut self, sink: impl AudioSink + 'static) -> Self {
        self.audio_output = Some(Box::new(sink));
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Replace the built-in tool set.
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    #[must_use]
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    #[must_use]
    pub fn wake(mut self, trigger: WakeTrigger) -> Self {
        self.wake = Some(trigger);
        self
    }

    /// Use a custom transport instead of the WebSocket endpoint.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    #[must_use]
    pub fn config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    fn setup(&self, tools: &ToolRegistry) -> Result<Setup> {
        let declarations = tools.declarations()?;
        Ok(Setup {
            model: self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: self.voice.clone().map(SpeechConfig::prebuilt),
            }),
            system_instruction: Some(Content::text(self.instruction.as_deref().unwrap_or(DEFAULT_INSTRUCTION))),
            tools: if declarations.function_declarations.is_empty() { Vec::new() } else { vec![declarations] },
            input_audio_transcription: Some(AudioTranscriptionConfig::default()),
            output_audio_transcription: Some(AudioTranscriptionConfig::default()),
        })
    }

    /// Start the session task. Must be called inside a Tokio runtime.
    ///
    /// A missing API key is not an error here; it is reported by
    /// [`LiveSession::connect`].
    ///
    /// # Errors
    /// Returns an error if the tool schema cannot be serialized.
    #[allow(clippy::result_large_err)]
    pub fn build(mut self) -> Result<LiveSession> {
        let capabilities = self.capabilities.take().unwrap_or_default();
        let tools = self.tools.take().unwrap_or_else(|| ToolRegistry::builtin(&capabilities));
        let setup = self.setup(&tools)?;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(self.endpoint.map_or_else(WsConnector::default, WsConnector::new)),
        };
        let audio_output: Box<dyn AudioSink> = match self.audio_output {
            Some(sink) => sink,
            None => Box::new(SoftwareSink::new()),
        };

        Ok(LiveSession::spawn(SessionParts {
            config: self.config,
            credential: self.api_key,
            setup,
            connector,
            audio_input: self.audio_input,
            audio_output,
            tools,
            files: Arc::clone(&capabilities.files),
            handlers: self.handlers,
            wake: self.wake.map(Arc::new),
            monitor: Some(capabilities.scheduler.start_monitor()),
        }))
    }
}

impl Default for LiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_declares_builtin_tools_and_transcription() {
        let builder = Live::builder().model("models/test").voice("Puck").instruction("Be brief.");
        let tools = ToolRegistry::builtin(&Capabilities::default());
        let setup = builder.setup(&tools).unwrap();

        let json = serde_json::to_value(&setup).unwrap();
        assert_eq!(json["model"], "models/test");
        assert_eq!(json["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(json["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"], "Puck");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(json["tools"][0]["functionDeclarations"].as_array().unwrap().len(), 8);
        assert_eq!(json["inputAudioTranscription"], serde_json::json!({}));
    }

    #[test]
    fn empty_registry_declares_no_tools() {
        let setup = Live::builder().setup(&ToolRegistry::new()).unwrap();
        assert!(setup.tools.is_empty());
        assert_eq!(setup.model, DEFAULT_MODEL);
    }

    #[test]
    fn defaults_match_pipeline_rates() {
        let config = LiveConfig::default();
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.frame_samples, 4096);
    }
}
