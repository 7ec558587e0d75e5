//! Read/write access to a single user-granted directory.

use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tokio::sync::watch;

use crate::error::ProviderError;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// File access scoped to one externally granted directory.
///
/// Nothing is ever prompted for: until [`FileProvider::mount`] is called every
/// operation fails fast with [`ProviderError::NoDirectory`].
#[derive(Debug)]
pub struct FileProvider {
    root: RwLock<Option<PathBuf>>,
    ready: watch::Sender<bool>,
}

impl FileProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: RwLock::new(None),
            ready: watch::Sender::new(false),
        }
    }

    /// Grant access to `dir`.
    ///
    /// # Errors
    /// Returns an error if `dir` does not exist or is not a directory.
    pub async fn mount(&self, dir: impl Into<PathBuf>) -> ProviderResult<()> {
        let dir = dir.into();
        let meta = tokio::fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(ProviderError::InvalidName(dir.display().to_string()));
        }
        tracing::info!(dir = %dir.display(), "directory connected");
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = Some(dir);
        self.ready.send_replace(true);
        Ok(())
    }

    pub fn unmount(&self) {
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.ready.send_replace(false);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Observe readiness changes.
    #[must_use]
    pub fn watch_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Names of the regular files in the directory, sorted.
    ///
    /// # Errors
    /// Returns an error if no directory is connected or it cannot be read.
    pub async fn list_files(&self) -> ProviderResult<Vec<String>> {
        let root = self.root()?;
        let mut entries = tokio::fs::read_dir(&root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// # Errors
    /// Returns [`ProviderError::NotFound`] for a missing file, or an I/O error.
    pub async fn read_file(&self, name: &str) -> ProviderResult<String> {
        let path = self.resolve(name)?;
        tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(name.to_string()),
            _ => ProviderError::Io(e),
        })
    }

    /// Create or overwrite `name` with `text`.
    ///
    /// # Errors
    /// Returns an error if no directory is connected, the name is invalid, or the write fails.
    pub async fn write_file(&self, name: &str, text: &str) -> ProviderResult<String> {
        let path = self.resolve(name)?;
        tokio::fs::write(&path, text).await?;
        tracing::debug!(file = name, bytes = text.len(), "file written");
        Ok(format!("Successfully wrote {} bytes to {name}", text.len()))
    }

    fn root(&self) -> ProviderResult<PathBuf> {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProviderError::NoDirectory)
    }

    fn resolve(&self, name: &str) -> ProviderResult<PathBuf> {
        let root = self.root()?;
        let candidate = Path::new(name);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(root.join(candidate)),
            _ => Err(ProviderError::InvalidName(name.to_string())),
        }
    }
}

impl Default for FileProvider {
    fn default() -> Self {
        Self::new()
    }
}
