#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Realtime duplex session client.
//!
//! `LiveClient` is the low-level typed WebSocket client. The `sdk` module
//! builds the session manager on top of it: connection state machine, audio
//! capture and gapless playback, video sampling, tool dispatch against the
//! capability providers in `providers`, and barge-in handling.

pub mod error;
pub mod protocol;
pub mod providers;
pub mod sdk;
pub mod transport;

pub use error::{Error, ProviderError, Result, SetupError, ToolError};
pub use protocol::client_messages::ClientMessage;
pub use protocol::server_messages::ServerMessage;
pub use providers::{Capabilities, FileProvider, Navigator, Scheduler};
pub use sdk::{
    ConnectionState, Live, LiveBuilder, LiveConfig, LiveSession, SessionEvent, SessionHandle,
    SessionSnapshot, SessionState, ToolCall, ToolRegistry, ToolResult,
};

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use transport::ws::WsStream;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_MEDIA_CHUNK_BYTES: usize = 8 * 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Low-level client for the live endpoint.
///
/// Thread safety: `LiveClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`.
#[must_use]
pub struct LiveClient {
    stream: WsStream,
}

impl LiveClient {
    /// Connect to the live endpoint.
    ///
    /// # Errors
    /// Returns an error if the connection fails or if the URL is invalid.
    pub async fn connect(endpoint: &str, api_key: &str) -> Result<Self> {
        let stream = transport::ws::connect(endpoint, api_key).await?;
        Ok(Self { stream })
    }

    /// Send a client message to the server.
    ///
    /// # Errors
    /// Returns an error if validation or serialization fails, or if the WebSocket send fails.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        validate_client_message(message)?;
        let json = serde_json::to_string(message)?;
        tracing::trace!(kind = message.kind(), "Sending message: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receive the next server message. `Ok(None)` means the server closed cleanly.
    ///
    /// # Errors
    /// Returns an error if deserialization fails, the WebSocket fails, or the
    /// server closes with a non-normal close code.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received message: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(serde_json::from_str::<ServerMessage>(&text)?));
                }
                // The endpoint delivers its JSON in binary frames.
                Message::Binary(bytes) => {
                    tracing::trace!(bytes = bytes.len(), "Received binary message");
                    return Ok(Some(serde_json::from_slice::<ServerMessage>(&bytes)?));
                }
                Message::Close(frame) => {
                    tracing::info!(?frame, "WebSocket connection closed by server");
                    return match frame {
                        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            Err(Error::RemoteClosed {
                                code: u16::from(frame.code),
                                reason: frame.reason.as_str().to_string(),
                            })
                        }
                        _ => Ok(None),
                    };
                }
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                _ => (),
            }
        }
        Ok(None)
    }

    /// Send a close frame and flush the stream.
    ///
    /// # Errors
    /// Returns an error if the close handshake cannot be written.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.close().await?;
        Ok(())
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[allow(clippy::result_large_err)]
pub(crate) fn validate_client_message(message: &ClientMessage) -> Result<()> {
    match message {
        ClientMessage::RealtimeInput(input) => {
            for blob in input.blobs() {
                let size = estimate_base64_decoded_len(&blob.data)?;
                if size > MAX_MEDIA_CHUNK_BYTES {
                    return Err(Error::InvalidClientMessage(format!(
                        "realtimeInput {} chunk exceeds {MAX_MEDIA_CHUNK_BYTES} bytes ({size} bytes)",
                        blob.mime_type
                    )));
                }
            }
        }
        ClientMessage::ToolResponse(response) => {
            if response.function_responses.is_empty() {
                return Err(Error::InvalidClientMessage(
                    "toolResponse carries no function responses".to_string(),
                ));
            }
            if response.function_responses.iter().any(|r| r.id.is_empty()) {
                return Err(Error::InvalidClientMessage(
                    "toolResponse function response without id".to_string(),
                ));
            }
        }
        ClientMessage::Setup(setup) => {
            if setup.model.is_empty() {
                return Err(Error::InvalidClientMessage("setup requires a model".to_string()));
            }
        }
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidClientMessage(
            "realtimeInput invalid base64 length".to_string(),
        ));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(Error::InvalidClientMessage(
                "realtimeInput invalid base64 padding".to_string(),
            ));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(Error::InvalidClientMessage(
                "realtimeInput invalid base64 character".to_string(),
            ));
        }
    }

    if padding > 2 {
        return Err(Error::InvalidClientMessage(
            "realtimeInput invalid base64 padding length".to_string(),
        ));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}
