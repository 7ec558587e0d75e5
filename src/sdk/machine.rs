//! Pure session state machine.
//!
//! [`Machine::handle`] maps `(state, input)` to `(state, effects)` and never
//! performs I/O. Every input that originates from a session carries that
//! session's generation; inputs from a superseded generation are ignored, so
//! late messages, closes and tool results from an old connection cannot touch
//! the current one. The driver in `session` executes the effects in order.

use super::events::SessionEvent;
use super::tools::{ToolCall, ToolOutcome, ToolResult};
use crate::protocol::server_messages::{ServerContent, ServerMessage};

/// User-visible message for a failed or dropped connection. The detail goes
/// out as a [`SessionEvent::Error`].
pub const CONNECTION_ERROR: &str = "Connection error. Please try again.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug)]
pub(crate) enum Input {
    Connect,
    Opened { generation: u64 },
    /// Connect-time failure: credential, transport open, or capture device.
    SetupFailed { generation: u64, reason: String },
    Disconnect,
    /// Transport closed; `error` is set when it failed rather than closed cleanly.
    Closed { generation: u64, error: Option<String> },
    Message { generation: u64, message: Box<ServerMessage> },
    ToolsFinished { generation: u64, outcomes: Vec<ToolOutcome> },
}

#[derive(Debug, PartialEq)]
pub(crate) enum Effect {
    /// Stop pipelines, silence playback, close the transport.
    Teardown,
    Open { generation: u64 },
    StartPipelines { generation: u64 },
    /// PCM16 audio; `sample_rate` is `None` when the chunk did not say.
    Play { pcm: Vec<u8>, sample_rate: Option<u32> },
    Interrupt,
    Dispatch { generation: u64, calls: Vec<ToolCall> },
    SendToolResponse { generation: u64, results: Vec<ToolResult> },
    Emit(SessionEvent),
    Listen(bool),
}

#[derive(Debug, Default)]
pub(crate) struct Machine {
    state: ConnectionState,
    /// Generation of the live session, 0 when there is none.
    generation: u64,
    last_generation: u64,
    transcript: String,
    error: Option<String>,
}

impl Machine {
    pub(crate) const fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn transcript(&self) -> &str {
        &self.transcript
    }

    pub(crate) fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Connect => self.connect(),
            Input::Opened { generation } if generation == self.generation => {
                let mut effects = self.transition(ConnectionState::Connected);
                effects.push(Effect::StartPipelines { generation });
                effects
            }
            Input::SetupFailed { generation, reason } if generation == self.generation => {
                self.error = Some(reason.clone());
                let mut effects = vec![Effect::Emit(SessionEvent::Error(reason))];
                effects.extend(self.transition(ConnectionState::Error));
                effects.extend(self.end_session());
                effects
            }
            Input::Disconnect => {
                if self.state == ConnectionState::Disconnected && self.generation == 0 {
                    return Vec::new();
                }
                self.end_session()
            }
            Input::Closed { generation, error } if generation == self.generation => {
                let mut effects = Vec::new();
                if let Some(detail) = error {
                    self.error = Some(CONNECTION_ERROR.to_string());
                    effects.push(Effect::Emit(SessionEvent::Error(detail)));
                    if self.state != ConnectionState::Connected {
                        effects.extend(self.transition(ConnectionState::Error));
                    }
                }
                effects.extend(self.end_session());
                effects
            }
            Input::Message { generation, message }
                if generation == self.generation && self.state == ConnectionState::Connected =>
            {
                self.on_message(generation, *message)
            }
            Input::ToolsFinished { generation, outcomes } if generation == self.generation => {
                self.on_tools_finished(generation, outcomes)
            }
            stale => {
                tracing::trace!(?stale, current = self.generation, "ignoring input from superseded session");
                Vec::new()
            }
        }
    }

    fn connect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.generation != 0 || self.state != ConnectionState::Disconnected {
            effects.push(Effect::Teardown);
            self.generation = 0;
        }
        self.transcript.clear();
        self.error = None;
        self.last_generation += 1;
        self.generation = self.last_generation;

        effects.push(Effect::Listen(false));
        effects.extend(self.transition(ConnectionState::Connecting));
        effects.push(Effect::Open { generation: self.generation });
        effects
    }

    /// Common tail of every way a session ends.
    fn end_session(&mut self) -> Vec<Effect> {
        self.generation = 0;
        self.transcript.clear();
        let mut effects = vec![Effect::Teardown];
        effects.extend(self.transition(ConnectionState::Disconnected));
        effects.push(Effect::Listen(true));
        effects
    }

    fn transition(&mut self, next: ConnectionState) -> Vec<Effect> {
        if self.state == next {
            return Vec::new();
        }
        tracing::debug!(from = ?self.state, to = ?next, generation = self.generation, "session state changed");
        self.state = next;
        vec![Effect::Emit(SessionEvent::StateChanged(next))]
    }

    fn on_message(&mut self, generation: u64, message: ServerMessage) -> Vec<Effect> {
        let mut effects = Vec::new();
        if message.setup_complete.is_some() {
            tracing::info!(generation, "setup complete");
            effects.push(Effect::Emit(SessionEvent::SetupComplete));
        }
        if let Some(content) = message.server_content {
            effects.extend(self.on_content(&content));
        }
        if let Some(request) = message.tool_call {
            let calls: Vec<ToolCall> = request.function_calls.into_iter().map(ToolCall::from).collect();
            if !calls.is_empty() {
                effects.extend(calls.iter().cloned().map(|call| Effect::Emit(SessionEvent::ToolCall(call))));
                effects.push(Effect::Dispatch { generation, calls });
            }
        }
        if let Some(cancellation) = message.tool_call_cancellation {
            effects.push(Effect::Emit(SessionEvent::ToolCallCancelled(cancellation.ids)));
        }
        if let Some(go_away) = message.go_away {
            tracing::warn!(generation, time_left = ?go_away.time_left, "server is going away");
            effects.push(Effect::Emit(SessionEvent::GoAway { time_left: go_away.time_left }));
        }
        effects
    }

    fn on_content(&mut self, content: &ServerContent) -> Vec<Effect> {
        let mut effects = Vec::new();
        if content.interrupted {
            self.transcript.clear();
            effects.push(Effect::Interrupt);
            effects.push(Effect::Emit(SessionEvent::Interrupted));
        }
        for blob in content.inline_audio() {
            let Some(sample_rate) = blob.pcm_rate() else {
                tracing::warn!(mime = %blob.mime_type, "skipping non-PCM inline data");
                continue;
            };
            match blob.decode() {
                Ok(pcm) => effects.push(Effect::Play { pcm, sample_rate }),
                Err(err) => tracing::warn!(error = %err, mime = %blob.mime_type, "dropping undecodable audio chunk"),
            }
        }
        if let Some(text) = content.input_text() {
            effects.push(Effect::Emit(SessionEvent::InputTranscript(text.to_string())));
        }
        if let Some(text) = content.output_text() {
            self.transcript.push_str(text);
            effects.push(Effect::Emit(SessionEvent::OutputTranscript(text.to_string())));
        }
        if content.generation_complete {
            effects.push(Effect::Emit(SessionEvent::GenerationComplete));
        }
        if content.turn_complete {
            effects.push(Effect::Emit(SessionEvent::TurnComplete));
        }
        effects
    }

    fn on_tools_finished(&mut self, generation: u64, outcomes: Vec<ToolOutcome>) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(outcomes.len() + 1);
        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if let Some(note) = outcome.note {
                if !self.transcript.is_empty() && !self.transcript.ends_with('\n') {
                    self.transcript.push('\n');
                }
                self.transcript.push_str(&note);
                self.transcript.push('\n');
            }
            effects.push(Effect::Emit(SessionEvent::ToolResult(outcome.result.clone())));
            results.push(outcome.result);
        }
        effects.push(Effect::SendToolResponse { generation, results });
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::models::{Blob, Content, FunctionCall, Part, Transcription};
    use serde_json::json;

    fn connected() -> Machine {
        let mut machine = Machine::default();
        machine.handle(Input::Connect);
        machine.handle(Input::Opened { generation: machine.generation() });
        machine
    }

    fn content(content: ServerContent) -> Input {
        Input::Message { generation: 1, message: Box::new(ServerMessage::content(content)) }
    }

    fn states(effects: &[Effect]) -> Vec<ConnectionState> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(SessionEvent::StateChanged(s)) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_then_open_starts_pipelines() {
        let mut machine = Machine::default();
        let effects = machine.handle(Input::Connect);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(!effects.contains(&Effect::Teardown));
        assert_eq!(effects.last(), Some(&Effect::Open { generation: 1 }));

        let effects = machine.handle(Input::Opened { generation: 1 });
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(effects.contains(&Effect::StartPipelines { generation: 1 }));
    }

    #[test]
    fn reconnect_tears_down_before_opening() {
        let mut machine = connected();
        let effects = machine.handle(Input::Connect);
        let teardown = effects.iter().position(|e| *e == Effect::Teardown).unwrap();
        let open = effects.iter().position(|e| *e == Effect::Open { generation: 2 }).unwrap();
        assert!(teardown < open);
        assert_eq!(machine.generation(), 2);
    }

    #[test]
    fn setup_failure_passes_through_error_to_disconnected() {
        let mut machine = Machine::default();
        machine.handle(Input::Connect);
        let effects = machine.handle(Input::SetupFailed { generation: 1, reason: "denied".to_string() });

        assert_eq!(states(&effects), [ConnectionState::Error, ConnectionState::Disconnected]);
        assert!(effects.contains(&Effect::Teardown));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.error(), Some("denied"));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut machine = connected();
        let first = machine.handle(Input::Disconnect);
        assert!(first.contains(&Effect::Teardown));
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        assert!(machine.handle(Input::Disconnect).is_empty());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_error_sets_generic_message() {
        let mut machine = connected();
        let effects = machine.handle(Input::Closed { generation: 1, error: Some("reset by peer".to_string()) });

        assert!(effects.contains(&Effect::Emit(SessionEvent::Error("reset by peer".to_string()))));
        assert_eq!(machine.error(), Some(CONNECTION_ERROR));
        assert_eq!(states(&effects), [ConnectionState::Disconnected]);
    }

    #[test]
    fn clean_close_leaves_no_error() {
        let mut machine = connected();
        machine.handle(Input::Closed { generation: 1, error: None });
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.error(), None);
    }

    #[test]
    fn stale_inputs_are_ignored() {
        let mut machine = connected();
        machine.handle(Input::Connect);
        machine.handle(Input::Opened { generation: 2 });

        assert!(machine.handle(Input::Closed { generation: 1, error: None }).is_empty());
        assert!(machine.handle(Input::ToolsFinished { generation: 1, outcomes: Vec::new() }).is_empty());
        assert!(machine.handle(content(ServerContent { interrupted: true, ..ServerContent::default() })).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn audio_and_transcript_flow_through() {
        let mut machine = connected();
        let turn = Content {
            role: Some("model".to_string()),
            parts: vec![Part { text: None, inline_data: Some(Blob::pcm16(&[1, 0, 2, 0], 24_000)) }],
        };
        let effects = machine.handle(content(ServerContent {
            model_turn: Some(turn),
            output_transcription: Some(Transcription { text: Some("Hello".to_string()), finished: None }),
            input_transcription: Some(Transcription { text: Some("hi".to_string()), finished: None }),
            ..ServerContent::default()
        }));

        assert!(effects.contains(&Effect::Play { pcm: vec![1, 0, 2, 0], sample_rate: Some(24_000) }));
        assert!(effects.contains(&Effect::Emit(SessionEvent::InputTranscript("hi".to_string()))));
        assert_eq!(machine.transcript(), "Hello");
    }

    #[test]
    fn interrupt_clears_transcript() {
        let mut machine = connected();
        machine.handle(content(ServerContent {
            output_transcription: Some(Transcription { text: Some("partial".to_string()), finished: None }),
            ..ServerContent::default()
        }));
        let effects = machine.handle(content(ServerContent { interrupted: true, ..ServerContent::default() }));

        assert_eq!(effects.first(), Some(&Effect::Interrupt));
        assert!(machine.transcript().is_empty());
    }

    #[test]
    fn tool_calls_round_trip_with_notes() {
        let mut machine = connected();
        let message = ServerMessage::tool_call(vec![FunctionCall {
            id: "c1".to_string(),
            name: "writeFile".to_string(),
            args: json!({"filename": "a.txt", "content": "x"}),
        }]);
        let effects = machine.handle(Input::Message { generation: 1, message: Box::new(message) });
        assert!(effects.iter().any(|e| matches!(e, Effect::Dispatch { generation: 1, calls } if calls.len() == 1)));

        let result = ToolResult { id: "c1".to_string(), name: "writeFile".to_string(), output: "ok".to_string() };
        let effects = machine.handle(Input::ToolsFinished {
            generation: 1,
            outcomes: vec![ToolOutcome { result: result.clone(), note: Some("[Saved a.txt]".to_string()) }],
        });
        assert_eq!(
            effects.last(),
            Some(&Effect::SendToolResponse { generation: 1, results: vec![result] })
        );
        assert_eq!(machine.transcript(), "[Saved a.txt]\n");
    }

    #[test]
    fn non_pcm_parts_are_not_played() {
        let mut machine = connected();
        let turn = Content {
            role: None,
            parts: vec![
                Part { text: None, inline_data: Some(Blob::jpeg(&[0xFF, 0xD8])) },
                Part { text: None, inline_data: Some(Blob::pcm16(&[0, 0], 16_000)) },
            ],
        };
        let effects = machine.handle(content(ServerContent { model_turn: Some(turn), ..ServerContent::default() }));

        let played: Vec<_> = effects.iter().filter(|e| matches!(e, Effect::Play { .. })).collect();
        assert_eq!(played, [&Effect::Play { pcm: vec![0, 0], sample_rate: Some(16_000) }]);
    }
}
