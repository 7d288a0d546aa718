//! Transient link/selection handoff, consumed by a single read

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Values captured by one command and picked up by the next `shorten`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Handoff {
    pub context_menu_url: Option<String>,
    pub selected_text: Option<String>,
}

impl Handoff {
    pub fn is_empty(&self) -> bool {
        self.context_menu_url.is_none() && self.selected_text.is_none()
    }
}

/// File-backed handoff slot
#[derive(Debug)]
pub struct HandoffStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HandoffStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Stash a link target, plus the selection to use as its keyword if any.
    pub async fn stash_link(&self, url: &str, selection: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut handoff = self.read().await;

        handoff.context_menu_url = Some(url.trim().to_string());
        if let Some(text) = selection.map(str::trim).filter(|t| !t.is_empty()) {
            handoff.selected_text = Some(text.to_string());
        }

        self.write(&handoff).await
    }

    /// Stash selected text to use as the keyword for the current page.
    pub async fn stash_selection(&self, text: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut handoff = self.read().await;
        handoff.selected_text = Some(text.trim().to_string());
        self.write(&handoff).await
    }

    /// Return whatever is stashed and clear it.
    pub async fn take(&self) -> Result<Handoff> {
        let _guard = self.lock.lock().await;
        let handoff = self.read().await;

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !handoff.is_empty() {
            debug!("Consumed handoff from {}", self.path.display());
        }
        Ok(handoff)
    }

    async fn read(&self) -> Handoff {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding malformed handoff {}: {}", self.path.display(), e);
                Handoff::default()
            }),
            Err(_) => Handoff::default(),
        }
    }

    async fn write(&self, handoff: &Handoff) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, serde_json::to_vec(handoff)?).await?;
        Ok(())
    }
}
