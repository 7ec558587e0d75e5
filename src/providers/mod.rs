//! Local capability providers invoked by the tool dispatcher.
//!
//! Providers are independent of the session: they are constructed by the
//! embedding application, shared with the dispatcher through [`Capabilities`],
//! and may outlive any number of connections.

pub mod files;
pub mod navigation;
pub mod scheduler;

pub use files::FileProvider;
pub use navigation::{Launcher, NavigationOutcome, Navigator, SystemLauncher};
pub use scheduler::{Clock, LogNotifier, MonitorHandle, Notifier, ScheduledEvent, Scheduler, SystemClock};

use std::sync::Arc;

/// The provider set exposed to the remote model as tools.
#[derive(Clone)]
pub struct Capabilities {
    pub files: Arc<FileProvider>,
    pub scheduler: Arc<Scheduler>,
    pub navigation: Arc<Navigator>,
}

impl Capabilities {
    #[must_use]
    pub const fn new(files: Arc<FileProvider>, scheduler: Arc<Scheduler>, navigation: Arc<Navigator>) -> Self {
        Self { files, scheduler, navigation }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            files: Arc::new(FileProvider::new()),
            scheduler: Arc::new(Scheduler::new()),
            navigation: Arc::new(Navigator::new()),
        }
    }
}
