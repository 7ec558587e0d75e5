//! Passive wake-phrase listening while disconnected.

use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::session::TaskGuard;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub is_final: bool,
}

/// Continuous speech recognition. Dropping the stream stops recognition.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// # Errors
    /// Returns an error if recognition cannot be started.
    async fn start(&self) -> Result<BoxStream<'static, Utterance>>;
}

pub struct WakeTrigger {
    recognizer: Arc<dyn SpeechRecognizer>,
    phrases: Vec<String>,
}

impl WakeTrigger {
    pub fn new<I, S>(recognizer: Arc<dyn SpeechRecognizer>, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| p.into().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { recognizer, phrases }
    }

    /// Whether `text` contains any trigger phrase, ignoring case.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.phrases.iter().any(|phrase| text.contains(phrase.as_str()))
    }

    /// Listen until a finalized utterance matches, then call `on_trigger`
    /// once and stop. Dropping the guard stops listening.
    pub(crate) fn listen<F>(self: &Arc<Self>, on_trigger: F) -> TaskGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let trigger = Arc::clone(self);
        TaskGuard::spawn(async move {
            let mut utterances = match trigger.recognizer.start().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "wake listener failed to start");
                    return;
                }
            };
            tracing::debug!("wake listener started");
            while let Some(utterance) = utterances.next().await {
                if utterance.is_final && trigger.matches(&utterance.text) {
                    tracing::info!(text = %utterance.text, "wake phrase heard");
                    drop(utterances);
                    on_trigger();
                    return;
                }
            }
            tracing::debug!("wake listener ended");
        })
    }
}
