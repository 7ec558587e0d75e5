use super::machine::ConnectionState;
use super::tools::{ToolCall, ToolResult};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    SetupComplete,
    InputTranscript(String),
    OutputTranscript(String),
    /// The remote turn was abandoned; queued audio has been stopped.
    Interrupted,
    TurnComplete,
    GenerationComplete,
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    /// The server no longer wants results for these ids. They are still sent.
    ToolCallCancelled(Vec<String>),
    /// The server will close the connection soon.
    GoAway { time_left: Option<String> },
    Error(String),
}

pub struct EventStream<'a> {
    rx: &'a mut mpsc::Receiver<SessionEvent>,
}

impl<'a> EventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for EventStream<'_> {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
