//! Best-effort browser navigation.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::ProviderError;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

const SEARCH_ENDPOINT: &str = "https://www.google.com/search";

/// Opens a URL in the user's browser.
///
/// Returns `Ok(true)` when the platform refused to open it (popup blocked,
/// no handler, launcher exited non-zero).
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn open(&self, url: &Url) -> ProviderResult<bool>;
}

/// Launches URLs with the platform's default handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

#[async_trait]
impl Launcher for SystemLauncher {
    async fn open(&self, url: &Url) -> ProviderResult<bool> {
        let mut command = if cfg!(target_os = "macos") {
            tokio::process::Command::new("open")
        } else if cfg!(target_os = "windows") {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.args(["/C", "start", ""]);
            cmd
        } else {
            tokio::process::Command::new("xdg-open")
        };
        command.arg(url.as_str());

        match command.status().await {
            Ok(status) => Ok(!status.success()),
            Err(err) => {
                tracing::warn!(error = %err, url = %url, "no launcher available");
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationOutcome {
    pub url: String,
    pub blocked: bool,
}

impl NavigationOutcome {
    #[must_use]
    pub fn describe(&self) -> String {
        if self.blocked {
            format!("Could not open {} (blocked). Ask the user to open it manually.", self.url)
        } else {
            format!("Opened {}", self.url)
        }
    }
}

pub struct Navigator {
    launcher: Arc<dyn Launcher>,
}

impl Navigator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_launcher(Arc::new(SystemLauncher))
    }

    #[must_use]
    pub fn with_launcher(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }

    /// Open a web search for `query`.
    ///
    /// # Errors
    /// Returns an error only if the launcher itself fails.
    pub async fn search_web(&self, query: &str) -> ProviderResult<NavigationOutcome> {
        let url = Url::parse_with_params(SEARCH_ENDPOINT, [("q", query.trim())])
            .map_err(|e| ProviderError::InvalidUrl(e.to_string()))?;
        self.launch(url).await
    }

    /// Open `raw`, assuming `https://` when no scheme is given.
    ///
    /// # Errors
    /// Returns [`ProviderError::InvalidUrl`] for unparsable input or a scheme
    /// other than http/https.
    pub async fn open_url(&self, raw: &str) -> ProviderResult<NavigationOutcome> {
        let url = normalize_url(raw)?;
        self.launch(url).await
    }

    async fn launch(&self, url: Url) -> ProviderResult<NavigationOutcome> {
        let blocked = self.launcher.open(&url).await?;
        if blocked {
            tracing::warn!(url = %url, "navigation blocked");
        } else {
            tracing::debug!(url = %url, "navigation opened");
        }
        Ok(NavigationOutcome {
            url: url.into(),
            blocked,
        })
    }
}

impl Default for Navigator {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_url(raw: &str) -> ProviderResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProviderError::InvalidUrl(String::new()));
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&candidate).map_err(|_| ProviderError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ProviderError::InvalidUrl(raw.to_string())),
    }
}
