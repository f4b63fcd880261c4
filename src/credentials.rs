// src/credentials.rs
//! API key storage shared by the Gemini client and the video trackers.
//!
//! The key is read on every request so a freshly selected key takes effect
//! immediately. The status flag is what callers render ("select your key");
//! trackers flip it to `Absent` when the backend stops recognising the key.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Present,
    Absent,
}

struct Inner {
    key: RwLock<Option<String>>,
    status: watch::Sender<CredentialStatus>,
}

/// Cloneable handle to the process-wide credential
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    pub fn new(api_key: Option<String>) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let status = if api_key.is_some() {
            CredentialStatus::Present
        } else {
            CredentialStatus::Absent
        };
        let (status_tx, _) = watch::channel(status);

        Self {
            inner: Arc::new(Inner {
                key: RwLock::new(api_key),
                status: status_tx,
            }),
        }
    }

    pub fn status(&self) -> CredentialStatus {
        *self.inner.status.borrow()
    }

    pub fn is_present(&self) -> bool {
        self.status() == CredentialStatus::Present
    }

    /// Receive every status change
    pub fn subscribe(&self) -> watch::Receiver<CredentialStatus> {
        self.inner.status.subscribe()
    }

    /// Current key, if one was ever selected.
    ///
    /// An invalidated key is still returned: jobs already in flight keep
    /// polling with it and fail on their own if the backend rejects it.
    pub async fn api_key(&self) -> Option<String> {
        self.inner.key.read().await.clone()
    }

    /// Store a newly selected key and mark the credential present
    pub async fn select(&self, api_key: String) {
        *self.inner.key.write().await = Some(api_key);
        self.inner.status.send_replace(CredentialStatus::Present);
        tracing::info!("🔑 API key selected");
    }

    /// Drop the "credential present" assumption. Returns true if it was set.
    pub fn invalidate(&self) -> bool {
        let changed = self.inner.status.send_if_modified(|status| {
            if *status == CredentialStatus::Absent {
                false
            } else {
                *status = CredentialStatus::Absent;
                true
            }
        });
        if changed {
            tracing::warn!("🔑 API key invalidated, re-selection required");
        }
        changed
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
