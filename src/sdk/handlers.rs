use super::machine::ConnectionState;
use std::sync::Arc;

pub type VolumeHandler = Arc<dyn Fn(f32) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Synchronous callbacks for the UI layer. They run on the session task and
/// must return quickly.
#[derive(Default, Clone)]
pub struct EventHandlers {
    pub on_volume: Option<VolumeHandler>,
    pub on_state: Option<StateHandler>,
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Output level in `[0, 1]`, sampled on the volume cadence while connected.
    #[must_use]
    pub fn on_volume<F>(mut self, handler: F) -> Self
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.on_volume = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_state<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(handler));
        self
    }

    pub(crate) fn volume(&self, level: f32) {
        if let Some(handler) = &self.on_volume {
            handler(level);
        }
    }

    pub(crate) fn state(&self, state: ConnectionState) {
        if let Some(handler) = &self.on_state {
            handler(state);
        }
    }
}
