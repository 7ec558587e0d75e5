use live_rt_rs::protocol::client_messages::{ClientMessage, ToolResponse};
use live_rt_rs::protocol::models::{Blob, FunctionResponse};
use live_rt_rs::protocol::server_messages::ServerMessage;
use serde_json::json;

#[test]
fn audio_chunk_serializes_as_realtime_input() {
    let message = ClientMessage::audio(Blob::pcm16(&[0, 0, 255, 127], 16_000));
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(
        json,
        json!({"realtimeInput": {"audio": {"mimeType": "audio/pcm;rate=16000", "data": "AAD/fw=="}}})
    );
}

#[test]
fn video_frame_serializes_as_realtime_input() {
    let message = ClientMessage::video(Blob::jpeg(&[0xFF, 0xD8]));
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["realtimeInput"]["video"]["mimeType"], "image/jpeg");
    assert!(json["realtimeInput"].get("audio").is_none());
}

#[test]
fn tool_response_nests_output_under_result() {
    let message = ClientMessage::ToolResponse(ToolResponse {
        function_responses: vec![FunctionResponse::new("call-1", "listFiles", "notes.txt")],
    });
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(
        json,
        json!({"toolResponse": {"functionResponses": [
            {"id": "call-1", "name": "listFiles", "response": {"result": {"output": "notes.txt"}}}
        ]}})
    );
}

#[test]
fn server_content_parses_audio_and_transcription() {
    let raw = json!({
        "serverContent": {
            "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}}]},
            "outputTranscription": {"text": "Hi"},
            "turnComplete": true
        }
    });
    let message: ServerMessage = serde_json::from_value(raw).unwrap();
    let content = message.server_content.unwrap();

    assert_eq!(content.inline_audio().count(), 1);
    assert_eq!(content.output_text(), Some("Hi"));
    assert!(content.turn_complete);
    assert!(!content.interrupted);
}

#[test]
fn tool_call_parses_without_args() {
    let raw = r#"{"toolCall":{"functionCalls":[{"id":"a","name":"listEvents"}]}}"#;
    let message: ServerMessage = serde_json::from_str(raw).unwrap();
    let calls = message.tool_call.unwrap().function_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "listEvents");
    assert!(calls[0].args.is_null());
}

#[test]
fn unknown_server_fields_are_ignored() {
    let raw = r#"{"setupComplete":{},"sessionResumptionUpdate":{"newHandle":"x"}}"#;
    let message: ServerMessage = serde_json::from_str(raw).unwrap();
    assert!(message.setup_complete.is_some());
    assert!(message.server_content.is_none());
}

#[test]
fn cancellation_and_go_away_parse() {
    let cancel: ServerMessage = serde_json::from_str(r#"{"toolCallCancellation":{"ids":["a","b"]}}"#).unwrap();
    assert_eq!(cancel.tool_call_cancellation.unwrap().ids, vec!["a", "b"]);

    let go_away: ServerMessage = serde_json::from_str(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap();
    assert_eq!(go_away.go_away.unwrap().time_left.as_deref(), Some("10s"));
}
