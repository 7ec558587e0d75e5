//! Session layer over the live protocol.
//!
//! [`LiveSession`] owns one background task that drives a pure state machine
//! ([`machine`]) and the pipelines around it: microphone capture, gapless
//! playback, camera sampling, tool dispatch and the optional wake listener.
//! Devices are reached through traits so the embedding application decides
//! which audio and video backends to use.

mod builder;
mod builtin;
pub mod capture;
pub mod events;
mod handlers;
pub mod machine;
pub mod playback;
mod session;
mod tools;
mod transport;
pub mod video;
pub mod wake;

pub use builder::{API_KEY_ENV, Live, LiveBuilder, LiveConfig};
pub use builtin::{
    DeleteEventArgs, ListEventsArgs, ListFilesArgs, OpenUrlArgs, ReadFileArgs, ScheduleEventArgs, SearchWebArgs,
    WriteFileArgs,
};
pub use capture::{AudioInput, AudioStream, ChannelInput, FrameAssembler, SampleFeeder};
pub use events::{EventStream, SessionEvent};
pub use handlers::{EventHandlers, StateHandler, VolumeHandler};
pub use machine::{CONNECTION_ERROR, ConnectionState};
pub use playback::{AudioSink, PlaybackBuffer, PlaybackScheduler, ScheduledBuffer, SoftwareSink};
pub use session::{LiveSession, SessionHandle, SessionSnapshot, SessionState};
pub use tools::{
    BoxFuture as ToolFuture, ToolCall, ToolDefinition, ToolOutcome, ToolOutput, ToolRegistry, ToolReply, ToolResult,
};
pub use transport::{BoxFuture, Connector, Transport, WsConnector};
pub use video::VideoSource;
pub use wake::{SpeechRecognizer, Utterance, WakeTrigger};
