use crate::protocol::client_messages::{ClientMessage, Setup};
use crate::protocol::server_messages::ServerMessage;
use crate::{LiveClient, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An open duplex link to the remote service.
pub trait Transport: Send {
    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<()>>;
    /// `Ok(None)` means the remote side closed cleanly.
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens transports. The returned transport has already sent `setup`.
pub trait Connector: Send + Sync {
    fn connect(&self, credential: &str, setup: Setup) -> BoxFuture<'_, Result<Box<dyn Transport>>>;
}

/// Connects over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(crate::transport::ws::DEFAULT_ENDPOINT)
    }
}

impl Connector for WsConnector {
    fn connect(&self, credential: &str, setup: Setup) -> BoxFuture<'_, Result<Box<dyn Transport>>> {
        let credential = credential.to_string();
        Box::pin(async move {
            let mut client = LiveClient::connect(&self.endpoint, &credential).await?;
            client.send(&ClientMessage::Setup(Box::new(setup))).await?;
            Ok(Box::new(WsTransport { client }) as Box<dyn Transport>)
        })
    }
}

struct WsTransport {
    client: LiveClient,
}

impl Transport for WsTransport {
    fn send(&mut self, message: ClientMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.send(&message).await })
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<ServerMessage>>> {
        Box::pin(async move { self.client.next_message().await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.close().await })
    }
}

/// Identifies one session generation. Stale once a newer session (or none)
/// has been installed as current.
#[derive(Debug, Clone)]
pub(crate) struct SessionToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl SessionToken {
    pub(crate) const fn new(generation: u64, current: Arc<AtomicU64>) -> Self {
        Self { generation, current }
    }

    pub(crate) fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.generation
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Sending half of a session link, gated on the session still being current.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    token: SessionToken,
    tx: mpsc::Sender<ClientMessage>,
}

impl Outbound {
    pub(crate) const fn new(token: SessionToken, tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { token, tx }
    }

    pub(crate) fn is_current(&self) -> bool {
        self.token.is_current()
    }

    pub(crate) const fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Queue `message` for the link. Returns `false` when the session has been
    /// superseded or the link is gone; the message is dropped in that case.
    pub(crate) async fn send(&self, message: ClientMessage) -> bool {
        if !self.is_current() {
            tracing::trace!(generation = self.token.generation, kind = message.kind(), "dropping message for superseded session");
            return false;
        }
        self.tx.send(message).await.is_ok()
    }
}
