use crate::error::SetupError;
use crate::protocol::client_messages::{ClientMessage, Setup, ToolResponse};
use crate::protocol::models::FunctionResponse;
use crate::protocol::server_messages::ServerMessage;
use crate::providers::{FileProvider, MonitorHandle};
use crate::{Error, Result};

use super::builder::LiveConfig;
use super::capture::{AudioInput, run_capture};
use super::events::{EventStream, SessionEvent};
use super::handlers::EventHandlers;
use super::machine::{ConnectionState, Effect, Input, Machine};
use super::playback::{AudioSink, PlaybackScheduler, SharedPlayback, run_volume_meter};
use super::tools::{ToolCall, ToolOutcome, ToolRegistry, ToolResult};
use super::transport::{Connector, Outbound, SessionToken, Transport};
use super::video::{SamplerSettings, VideoSource, run_video_sampler};
use super::wake::WakeTrigger;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_CAPACITY: usize = 16;
const OUTBOUND_CAPACITY: usize = 64;
/// How long teardown waits for the transport's close handshake.
const LINK_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Observable session fields, published after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub connection_state: ConnectionState,
    pub error: Option<String>,
    pub transcript: String,
}

/// [`SessionState`] plus file-provider readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub error: Option<String>,
    pub transcript: String,
    pub is_file_system_ready: bool,
}

/// Cloneable control handle. The session task runs until the owning
/// [`LiveSession`] and every handle are dropped.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Open a session, tearing down any existing one first. Resolves once the
    /// session is connected and capture is running.
    ///
    /// # Errors
    /// Returns [`Error::Setup`] for a missing credential, a denied or missing
    /// capture device, or a connect timeout; transport errors otherwise. The
    /// session is back in `Disconnected` when this fails.
    pub async fn connect(&self, video: Option<Box<dyn VideoSource>>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Connect { video, respond: tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close the session. Calling it with no session open is a no-op.
    ///
    /// # Errors
    /// Returns [`Error::ConnectionClosed`] only if the session task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Disconnect { respond: tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }
}

pub struct LiveSession {
    handle: SessionHandle,
    event_rx: mpsc::Receiver<SessionEvent>,
    files: Arc<FileProvider>,
    _monitor: Option<MonitorHandle>,
}

impl LiveSession {
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// See [`SessionHandle::connect`].
    ///
    /// # Errors
    /// Returns an error if the session could not be established.
    pub async fn connect(&self, video: Option<Box<dyn VideoSource>>) -> Result<()> {
        self.handle.connect(video).await
    }

    /// See [`SessionHandle::disconnect`].
    ///
    /// # Errors
    /// Returns an error only if the session task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle.disconnect().await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.handle.state.borrow().connection_state
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.handle.state.clone()
    }

    #[must_use]
    pub fn is_file_system_ready(&self) -> bool {
        self.files.is_ready()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let SessionState { connection_state, error, transcript } = self.state();
        SessionSnapshot { connection_state, error, transcript, is_file_system_ready: self.is_file_system_ready() }
    }

    #[must_use]
    pub const fn files(&self) -> &Arc<FileProvider> {
        &self.files
    }

    /// Receive the next session event. `None` once the session task is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    #[must_use]
    pub fn events(&mut self) -> EventStream<'_> {
        EventStream::new(&mut self.event_rx)
    }

    pub(crate) fn spawn(parts: SessionParts) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(parts.config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let files = Arc::clone(&parts.files);

        let driver = Driver {
            machine: Machine::default(),
            playback: Arc::new(Mutex::new(PlaybackScheduler::new(parts.audio_output, parts.config.output_sample_rate))),
            tools: Arc::new(parts.tools),
            config: parts.config,
            credential: parts.credential,
            setup: parts.setup,
            connector: parts.connector,
            audio_input: parts.audio_input,
            handlers: parts.handlers,
            wake: parts.wake,
            current: Arc::new(AtomicU64::new(0)),
            internal_tx,
            link: None,
            pipelines: Vec::new(),
            pending_video: None,
            setup_error: None,
            wake_guard: None,
            state_tx,
            event_tx,
        };
        tokio::spawn(driver.run(cmd_rx, internal_rx));

        Self {
            handle: SessionHandle { sender: cmd_tx, state: state_rx },
            event_rx,
            files,
            _monitor: parts.monitor,
        }
    }
}

/// Everything the builder hands to the session task.
pub(crate) struct SessionParts {
    pub config: LiveConfig,
    pub credential: Option<String>,
    pub setup: Setup,
    pub connector: Arc<dyn Connector>,
    pub audio_input: Option<Arc<dyn AudioInput>>,
    pub audio_output: Box<dyn AudioSink>,
    pub tools: ToolRegistry,
    pub files: Arc<FileProvider>,
    pub handlers: EventHandlers,
    pub wake: Option<Arc<WakeTrigger>>,
    pub monitor: Option<MonitorHandle>,
}

enum Command {
    Connect { video: Option<Box<dyn VideoSource>>, respond: oneshot::Sender<Result<()>> },
    Disconnect { respond: oneshot::Sender<()> },
}

/// Events produced by tasks the driver spawned.
enum Internal {
    Inbound { generation: u64, message: Box<ServerMessage> },
    Closed { generation: u64, error: Option<String> },
    ToolsFinished { generation: u64, outcomes: Vec<ToolOutcome> },
    WakeTriggered,
}

/// A spawned task that is aborted when the guard goes away.
pub(crate) struct TaskGuard(Option<JoinHandle<()>>);

impl TaskGuard {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(tokio::spawn(future)))
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.0.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Abort and wait until the task (and everything it owns) is gone.
    pub(crate) async fn stop(mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = &self.0 {
            task.abort();
        }
    }
}

/// The task that owns one session's transport.
struct Link {
    generation: u64,
    tx: mpsc::Sender<ClientMessage>,
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    fn spawn(generation: u64, transport: Box<dyn Transport>, internal: mpsc::UnboundedSender<Internal>) -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_link(generation, transport, rx, close_rx, internal));
        Self { generation, tx, close: Some(close_tx), task: Some(task) }
    }

    fn outbound(&self, current: Arc<AtomicU64>) -> Outbound {
        Outbound::new(SessionToken::new(self.generation, current), self.tx.clone())
    }

    async fn shutdown(mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(LINK_CLOSE_GRACE, &mut task).await.is_err() {
                tracing::warn!(generation = self.generation, "transport close timed out; dropping it");
                task.abort();
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run_link(
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    mut close: oneshot::Receiver<()>,
    internal: mpsc::UnboundedSender<Internal>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut close => {
                if let Err(err) = transport.close().await {
                    tracing::debug!(generation, error = %err, "ignoring error while closing transport");
                }
                return;
            }
            Some(message) = outbound.recv() => {
                let kind = message.kind();
                match transport.send(message).await {
                    Ok(()) => {}
                    Err(err) if err.is_message_scoped() => {
                        tracing::warn!(generation, kind, error = %err, "dropping rejected outbound message");
                    }
                    Err(err) => {
                        tracing::warn!(generation, error = %err, "transport send failed");
                        let _ = internal.send(Internal::Closed { generation, error: Some(err.to_string()) });
                        return;
                    }
                }
            }
            incoming = transport.next_message() => {
                match incoming {
                    Ok(Some(message)) => {
                        let _ = internal.send(Internal::Inbound { generation, message: Box::new(message) });
                    }
                    Ok(None) => {
                        tracing::info!(generation, "transport closed by server");
                        let _ = internal.send(Internal::Closed { generation, error: None });
                        return;
                    }
                    Err(err) if err.is_message_scoped() => {
                        tracing::warn!(generation, error = %err, "skipping unreadable server message");
                    }
                    Err(err) => {
                        tracing::warn!(generation, error = %err, "transport failed");
                        let _ = internal.send(Internal::Closed { generation, error: Some(err.to_string()) });
                        return;
                    }
                }
            }
        }
    }
}

/// Owns the state machine and executes its effects. All session state is
/// mutated here, one input at a time.
struct Driver {
    machine: Machine,
    config: LiveConfig,
    credential: Option<String>,
    setup: Setup,
    connector: Arc<dyn Connector>,
    audio_input: Option<Arc<dyn AudioInput>>,
    playback: SharedPlayback,
    tools: Arc<ToolRegistry>,
    handlers: EventHandlers,
    wake: Option<Arc<WakeTrigger>>,
    /// Generation allowed to send, 0 when none.
    current: Arc<AtomicU64>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    link: Option<Link>,
    pipelines: Vec<TaskGuard>,
    pending_video: Option<Box<dyn VideoSource>>,
    setup_error: Option<Error>,
    wake_guard: Option<TaskGuard>,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        self.set_listening(true);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect { video, respond }) => {
                        let result = self.connect(video).await;
                        let _ = respond.send(result);
                    }
                    Some(Command::Disconnect { respond }) => {
                        self.step(Input::Disconnect).await;
                        let _ = respond.send(());
                    }
                    None => break,
                },
                Some(event) = internal.recv() => self.on_internal(event).await,
            }
        }
        self.step(Input::Disconnect).await;
        self.set_listening(false);
        tracing::debug!("session task stopped");
    }

    async fn connect(&mut self, video: Option<Box<dyn VideoSource>>) -> Result<()> {
        self.pending_video = video;
        self.setup_error = None;
        self.step(Input::Connect).await;
        self.pending_video = None;
        match self.setup_error.take() {
            Some(err) => Err(err),
            None if self.machine.state() == ConnectionState::Connected => Ok(()),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Inbound { generation, message } => self.step(Input::Message { generation, message }).await,
            Internal::Closed { generation, error } => self.step(Input::Closed { generation, error }).await,
            Internal::ToolsFinished { generation, outcomes } => {
                self.step(Input::ToolsFinished { generation, outcomes }).await;
            }
            Internal::WakeTriggered => {
                if self.machine.state() == ConnectionState::Disconnected {
                    if let Err(err) = self.connect(None).await {
                        tracing::warn!(error = %err, "wake-triggered connect failed");
                    }
                }
            }
        }
    }

    /// Feed `input` to the machine and run the resulting effects, including
    /// any follow-up inputs they produce.
    async fn step(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for effect in self.machine.handle(input) {
                if let Some(next) = self.apply(effect).await {
                    queue.push_back(next);
                }
            }
        }
        self.publish();
    }

    async fn apply(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::Teardown => self.teardown().await,
            Effect::Open { generation } => {
                return Some(match self.open(generation).await {
                    Ok(()) => Input::Opened { generation },
                    Err(err) => self.setup_failed(generation, err),
                });
            }
            Effect::StartPipelines { generation } => {
                if let Err(err) = self.start_pipelines(generation).await {
                    return Some(self.setup_failed(generation, err));
                }
            }
            Effect::Play { pcm, sample_rate } => {
                let mut playback = self.playback.lock().await;
                let scheduled = match sample_rate {
                    Some(rate) => playback.enqueue_at(&pcm, rate),
                    None => playback.enqueue(&pcm),
                };
                if let Err(err) = scheduled {
                    tracing::warn!(error = %err, "dropping audio chunk");
                }
            }
            Effect::Interrupt => self.playback.lock().await.stop_all(),
            Effect::Dispatch { generation, calls } => self.dispatch(generation, calls),
            Effect::SendToolResponse { generation, results } => self.send_tool_response(generation, results).await,
            Effect::Emit(event) => self.emit(event),
            Effect::Listen(on) => self.set_listening(on),
        }
        None
    }

    fn setup_failed(&mut self, generation: u64, err: Error) -> Input {
        tracing::warn!(generation, error = %err, "session setup failed");
        let reason = err.to_string();
        self.setup_error = Some(err);
        Input::SetupFailed { generation, reason }
    }

    async fn open(&mut self, generation: u64) -> Result<()> {
        let credential = self
            .credential
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(SetupError::MissingCredential)?;
        let timeout = self.config.connect_timeout;
        let transport = tokio::time::timeout(timeout, self.connector.connect(credential, self.setup.clone()))
            .await
            .map_err(|_| SetupError::Timeout(timeout))??;

        self.current.store(generation, Ordering::Release);
        self.link = Some(Link::spawn(generation, transport, self.internal_tx.clone()));
        tracing::info!(generation, model = %self.setup.model, "session opened");
        Ok(())
    }

    async fn start_pipelines(&mut self, generation: u64) -> Result<()> {
        let outbound = match &self.link {
            Some(link) if link.generation == generation => link.outbound(Arc::clone(&self.current)),
            _ => return Err(Error::ConnectionClosed),
        };
        self.playback.lock().await.stop_all();

        let input = self
            .audio_input
            .clone()
            .ok_or_else(|| SetupError::Restricted("no audio input device configured".to_string()))?;
        let stream = input.open(self.config.input_sample_rate).await?;
        self.pipelines.push(TaskGuard::spawn(run_capture(
            stream,
            self.config.frame_samples,
            self.config.input_sample_rate,
            outbound.clone(),
        )));

        if let Some(source) = self.pending_video.take() {
            let settings = SamplerSettings {
                interval: self.config.video_interval,
                scale: self.config.video_scale,
                quality: self.config.jpeg_quality,
            };
            self.pipelines.push(TaskGuard::spawn(run_video_sampler(source, settings, outbound.clone())));
        }

        self.pipelines.push(TaskGuard::spawn(run_volume_meter(
            Arc::clone(&self.playback),
            self.handlers.clone(),
            self.config.volume_interval,
            outbound.token().clone(),
        )));
        tracing::debug!(generation, pipelines = self.pipelines.len(), "pipelines started");
        Ok(())
    }

    async fn teardown(&mut self) {
        let generation = self.current.swap(0, Ordering::AcqRel);
        for task in self.pipelines.drain(..) {
            task.stop().await;
        }
        self.playback.lock().await.stop_all();
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.handlers.volume(0.0);
        tracing::info!(generation, "session torn down");
    }

    fn dispatch(&self, generation: u64, calls: Vec<ToolCall>) {
        let tools = Arc::clone(&self.tools);
        let internal = self.internal_tx.clone();
        tracing::debug!(generation, calls = calls.len(), "dispatching tool calls");
        // Not tied to the session: results from a superseded session are
        // dropped by generation when they come back.
        tokio::spawn(async move {
            let outcomes = tools.dispatch_batch(calls).await;
            let _ = internal.send(Internal::ToolsFinished { generation, outcomes });
        });
    }

    async fn send_tool_response(&mut self, generation: u64, results: Vec<ToolResult>) {
        let Some(tx) = self.link.as_ref().filter(|link| link.generation == generation).map(|link| link.tx.clone())
        else {
            tracing::debug!(generation, "dropping tool response for closed session");
            return;
        };
        let (answerable, orphaned): (Vec<_>, Vec<_>) = results.into_iter().partition(|result| !result.id.is_empty());
        for result in &orphaned {
            tracing::warn!(generation, tool = %result.name, "dropping result for call without id");
        }
        if answerable.is_empty() {
            return;
        }
        let message = ClientMessage::ToolResponse(ToolResponse {
            function_responses: answerable.into_iter().map(FunctionResponse::from).collect(),
        });
        if tx.send(message).await.is_err() {
            tracing::warn!(generation, "transport gone before tool response could be sent");
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        if let SessionEvent::StateChanged(state) = &event {
            self.handlers.state(*state);
        }
        self.publish();
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => tracing::warn!(?event, "event consumer lagging; dropping event"),
        }
    }

    fn publish(&self) {
        let next = SessionState {
            connection_state: self.machine.state(),
            error: self.machine.error().map(str::to_string),
            transcript: self.machine.transcript().to_string(),
        };
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn set_listening(&mut self, on: bool) {
        if !on {
            self.wake_guard = None;
            return;
        }
        let Some(trigger) = &self.wake else {
            return;
        };
        if self.wake_guard.as_ref().is_some_and(|guard| !guard.is_finished()) {
            return;
        }
        let internal = self.internal_tx.clone();
        self.wake_guard = Some(trigger.listen(move || {
            let _ = internal.send(Internal::WakeTriggered);
        }));
    }
}
