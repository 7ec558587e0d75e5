use futures::channel::mpsc as fmpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use live_rt_rs::protocol::client_messages::{ClientMessage, Setup};
use live_rt_rs::protocol::models::{Blob, Content, FunctionCall, Part, Transcription};
use live_rt_rs::protocol::server_messages::{ServerContent, ServerMessage};
use live_rt_rs::sdk::{
    AudioSink, BoxFuture, CONNECTION_ERROR, ChannelInput, ConnectionState, Connector, EventHandlers, Live,
    LiveSession, PlaybackBuffer, SampleFeeder, SessionEvent, SpeechRecognizer, Transport, Utterance,
    VideoSource, WakeTrigger,
};
use live_rt_rs::{Error, Result, SetupError};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

/// The server side of one mock connection.
struct Remote {
    to_client: mpsc::UnboundedSender<Result<ServerMessage>>,
    from_client: mpsc::UnboundedReceiver<ClientMessage>,
    setup: Setup,
}

impl Remote {
    fn push(&self, message: ServerMessage) {
        self.to_client.send(Ok(message)).unwrap();
    }

    async fn next_message(&mut self) -> ClientMessage {
        tokio::time::timeout(WAIT, self.from_client.recv()).await.unwrap().unwrap()
    }
}

#[derive(Default)]
struct Stats {
    connects: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    closes: AtomicUsize,
}

struct MockConnector {
    remotes: mpsc::UnboundedSender<Remote>,
    stats: Arc<Stats>,
}

impl Connector for MockConnector {
    fn connect(&self, _credential: &str, setup: Setup) -> BoxFuture<'_, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let (to_client, incoming) = mpsc::unbounded_channel();
            let (outgoing, from_client) = mpsc::unbounded_channel();
            self.stats.connects.fetch_add(1, Ordering::SeqCst);
            let open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_open.fetch_max(open, Ordering::SeqCst);
            let _ = self.remotes.send(Remote { to_client, from_client, setup });
            Ok(Box::new(MockTransport { incoming, outgoing, stats: Arc::clone(&self.stats) }) as Box<dyn Transport>)
        })
    }
}

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Result<ServerMessage>>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    stats: Arc<Stats>,
}

impl Transport for MockTransport {
    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<()>> {
        // The WebSocket client refuses responses it cannot address.
        if let ClientMessage::ToolResponse(response) = &message {
            if response.function_responses.iter().any(|r| r.id.is_empty()) {
                let err = Error::InvalidClientMessage("toolResponse function response without id".into());
                return Box::pin(async move { Err(err) });
            }
        }
        let sent = self.outgoing.send(message).map_err(|_| Error::ConnectionClosed);
        Box::pin(async move { sent })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>> {
        Box::pin(async move {
            match self.incoming.recv().await {
                Some(message) => message.map(Some),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkLog {
    scheduled: Vec<(u64, f64)>,
    stopped: Vec<u64>,
}

/// Output sink with a clock frozen at zero.
#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<SinkLog>>);

impl AudioSink for RecordingSink {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn schedule(&mut self, buffer: &PlaybackBuffer, start: f64) -> Result<()> {
        self.0.lock().unwrap().scheduled.push((buffer.id, start));
        Ok(())
    }

    fn stop(&mut self, id: u64) {
        self.0.lock().unwrap().stopped.push(id);
    }

    fn output_energy(&self) -> f32 {
        0.0
    }
}

struct Harness {
    session: LiveSession,
    remotes: mpsc::UnboundedReceiver<Remote>,
    stats: Arc<Stats>,
    feeder: SampleFeeder,
}

impl Harness {
    async fn connect(&mut self) -> Remote {
        self.session.connect(None).await.unwrap();
        self.remotes.try_recv().unwrap()
    }

    async fn wait_for_state(&self, state: ConnectionState) {
        let mut watch = self.session.watch_state();
        tokio::time::timeout(WAIT, watch.wait_for(|s| s.connection_state == state))
            .await
            .unwrap()
            .unwrap();
    }

    async fn next_event_matching(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(WAIT, self.session.next_event()).await.unwrap().unwrap();
            if pred(&event) {
                return event;
            }
        }
    }
}

fn harness_with(configure: impl FnOnce(live_rt_rs::LiveBuilder) -> live_rt_rs::LiveBuilder) -> Harness {
    let (remotes_tx, remotes) = mpsc::unbounded_channel();
    let stats = Arc::new(Stats::default());
    let (input, feeder) = ChannelInput::new();
    let builder = Live::builder()
        .connector(MockConnector { remotes: remotes_tx, stats: Arc::clone(&stats) })
        .audio_input(input);
    let session = configure(builder).build().unwrap();
    Harness { session, remotes, stats, feeder }
}

fn harness() -> Harness {
    harness_with(|builder| builder.api_key("test-key"))
}

#[tokio::test]
async fn connect_sends_setup_and_starts_capture() {
    let mut h = harness();
    let remote = h.connect().await;

    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert_eq!(remote.setup.tools[0].function_declarations.len(), 8);
    assert!(remote.setup.system_instruction.is_some());
    assert!(h.feeder.is_active());
    assert_eq!(h.stats.open.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnect_closes_previous_transport_first() {
    let mut h = harness();
    let first = h.connect().await;
    let _second = h.connect().await;

    assert_eq!(h.stats.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.stats.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.closes.load(Ordering::SeqCst), 1);
    assert!(first.to_client.send(Ok(ServerMessage::default())).is_err());
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_twice_is_harmless() {
    let mut h = harness();
    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);

    let _remote = h.connect().await;
    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);

    assert!(!h.feeder.is_active());
    assert_eq!(h.stats.open.load(Ordering::SeqCst), 0);
    assert!(h.session.state().error.is_none());
}

#[tokio::test]
async fn every_tool_call_gets_one_response() {
    let mut h = harness();
    let mut remote = h.connect().await;

    remote.push(ServerMessage::tool_call(vec![
        FunctionCall { id: "a".into(), name: "writeFile".into(), args: json!({"filename": "a.txt", "content": "x"}) },
        FunctionCall { id: "b".into(), name: "noSuchTool".into(), args: json!({}) },
        FunctionCall { id: "c".into(), name: "listEvents".into(), args: serde_json::Value::Null },
    ]));

    let ClientMessage::ToolResponse(response) = remote.next_message().await else {
        panic!("expected a tool response");
    };
    let ids: HashSet<&str> = response.function_responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(response.function_responses.len(), 3);
    assert_eq!(ids, HashSet::from(["a", "b", "c"]));

    let output = |id: &str| {
        response.function_responses.iter().find(|r| r.id == id).unwrap().response.result.output.clone()
    };
    assert!(output("a").contains("No directory connected"));
    assert!(output("b").contains("Unknown tool"));
    assert_eq!(output("c"), "No scheduled events.");
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn calls_without_id_do_not_cost_the_rest_of_the_batch() {
    let mut h = harness();
    let mut remote = h.connect().await;

    let raw = json!({"toolCall": {"functionCalls": [
        {"name": "listEvents", "args": {}},
        {"id": "", "name": "listEvents", "args": {}},
        {"id": "b", "name": "listEvents", "args": {}}
    ]}});
    remote.push(serde_json::from_value(raw).unwrap());

    let ClientMessage::ToolResponse(response) = remote.next_message().await else {
        panic!("expected a tool response");
    };
    let ids: Vec<&str> = response.function_responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["b"]);
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert!(h.session.state().error.is_none());
}

#[tokio::test]
async fn unreadable_server_message_is_skipped() {
    let mut h = harness();
    let mut remote = h.connect().await;

    let unreadable = serde_json::from_str::<ServerMessage>("{\"toolCall\":").unwrap_err();
    remote.to_client.send(Err(unreadable.into())).unwrap();
    remote.push(ServerMessage::tool_call(vec![FunctionCall {
        id: "after".into(),
        name: "listEvents".into(),
        args: json!({}),
    }]));

    let ClientMessage::ToolResponse(response) = remote.next_message().await else {
        panic!("expected a tool response");
    };
    assert_eq!(response.function_responses[0].id, "after");
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn interrupt_stops_queued_audio_and_clears_transcript() {
    let sink = RecordingSink::default();
    let log = Arc::clone(&sink.0);
    let mut h = harness_with(move |builder| builder.api_key("k").audio_output(sink));
    let remote = h.connect().await;

    remote.push(ServerMessage::content(ServerContent {
        model_turn: Some(Content {
            role: None,
            parts: vec![Part { text: None, inline_data: Some(Blob::pcm16(&[0; 4800], 24_000)) }],
        }),
        output_transcription: Some(Transcription { text: Some("Once upon".into()), finished: None }),
        ..ServerContent::default()
    }));
    h.next_event_matching(|e| matches!(e, SessionEvent::OutputTranscript(_))).await;
    assert_eq!(h.session.state().transcript, "Once upon");

    remote.push(ServerMessage::content(ServerContent { interrupted: true, ..ServerContent::default() }));
    h.next_event_matching(|e| *e == SessionEvent::Interrupted).await;

    assert_eq!(log.lock().unwrap().scheduled, vec![(1, 0.0)]);
    assert_eq!(log.lock().unwrap().stopped, vec![1]);
    assert!(h.session.state().transcript.is_empty());
}

#[tokio::test]
async fn missing_credential_fails_without_connecting() {
    let mut h = harness_with(|builder| builder);
    let err = h.session.connect(None).await.unwrap_err();

    assert!(matches!(err, Error::Setup(SetupError::MissingCredential)));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert!(h.session.state().error.unwrap().contains("No API key"));
    assert_eq!(h.stats.connects.load(Ordering::SeqCst), 0);
    assert!(h.remotes.try_recv().is_err());
}

#[tokio::test]
async fn denied_microphone_tears_the_session_down() {
    let mut h = harness();
    h.feeder.set_denied(Some("blocked by user".into()));

    let err = h.session.connect(None).await.unwrap_err();
    assert!(matches!(err, Error::Setup(SetupError::DevicePermission(_))));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.stats.open.load(Ordering::SeqCst), 0);

    h.next_event_matching(|e| *e == SessionEvent::StateChanged(ConnectionState::Error)).await;
    h.next_event_matching(|e| *e == SessionEvent::StateChanged(ConnectionState::Disconnected)).await;
}

#[tokio::test]
async fn remote_close_returns_to_disconnected() {
    let mut h = harness();
    let remote = h.connect().await;
    drop(remote);

    h.wait_for_state(ConnectionState::Disconnected).await;
    assert!(h.session.state().error.is_none());
    assert!(!h.feeder.is_active());
}

#[tokio::test]
async fn transport_error_surfaces_generic_message() {
    let mut h = harness();
    let remote = h.connect().await;
    remote.to_client.send(Err(Error::RemoteClosed { code: 1011, reason: "internal".into() })).unwrap();

    let event = h.next_event_matching(|e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(event, SessionEvent::Error(detail) if detail.contains("1011")));
    h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(h.session.state().error.as_deref(), Some(CONNECTION_ERROR));
}

#[tokio::test]
async fn captured_audio_is_framed_and_sent() {
    let mut h = harness();
    let mut remote = h.connect().await;

    assert!(h.feeder.push(vec![0.25; 4096]));
    let ClientMessage::RealtimeInput(input) = remote.next_message().await else {
        panic!("expected realtime input");
    };
    let blob = input.audio.unwrap();
    assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
    assert_eq!(blob.decode().unwrap().len(), 4096 * 2);
}

struct StillCamera;

#[async_trait::async_trait]
impl VideoSource for StillCamera {
    fn dimensions(&self) -> (u32, u32) {
        (320, 240)
    }

    async fn capture(&mut self) -> Result<image::RgbImage> {
        Ok(image::RgbImage::new(320, 240))
    }
}

#[tokio::test]
async fn video_frames_are_sampled_while_connected() {
    let mut h = harness();
    h.session.connect(Some(Box::new(StillCamera))).await.unwrap();
    let mut remote = h.remotes.try_recv().unwrap();

    let ClientMessage::RealtimeInput(input) = remote.next_message().await else {
        panic!("expected realtime input");
    };
    let frame = input.video.unwrap();
    assert_eq!(frame.mime_type, "image/jpeg");
    let decoded = image::load_from_memory(&frame.decode().unwrap()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (80, 60));
}

#[tokio::test]
async fn volume_resets_to_zero_on_teardown() {
    let levels = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&levels);
    let handlers = EventHandlers::new().on_volume(move |level| recorded.lock().unwrap().push(level));
    let mut h = harness_with(move |builder| builder.api_key("k").handlers(handlers));

    let _remote = h.connect().await;
    h.session.disconnect().await.unwrap();
    assert_eq!(levels.lock().unwrap().last().copied(), Some(0.0));
}

/// Recognizer that hands the test a fresh utterance channel per start.
#[derive(Default)]
struct ScriptedRecognizer {
    feeds: Mutex<Vec<fmpsc::UnboundedSender<Utterance>>>,
}

#[async_trait::async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn start(&self) -> Result<BoxStream<'static, Utterance>> {
        let (tx, rx) = fmpsc::unbounded();
        self.feeds.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }
}

async fn wait_for_listeners(recognizer: &ScriptedRecognizer, count: usize) -> fmpsc::UnboundedSender<Utterance> {
    for _ in 0..200 {
        if let Some(feed) = recognizer.feeds.lock().unwrap().get(count - 1) {
            return feed.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("wake listener {count} never started");
}

#[tokio::test]
async fn wake_phrase_connects_and_listener_stops_while_connected() {
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let trigger = WakeTrigger::new(recognizer.clone(), ["hey gemini"]);
    let mut h = harness_with(move |builder| builder.api_key("k").wake(trigger));

    let feed = wait_for_listeners(&recognizer, 1).await;
    feed.unbounded_send(Utterance { text: "Hey Gemini".into(), is_final: false }).unwrap();
    feed.unbounded_send(Utterance { text: "okay hey gemini".into(), is_final: true }).unwrap();

    h.wait_for_state(ConnectionState::Connected).await;
    let _remote = h.remotes.recv().await.unwrap();
    assert!(feed.is_closed());

    h.session.disconnect().await.unwrap();
    let second = wait_for_listeners(&recognizer, 2).await;
    assert!(!second.is_closed());
}
