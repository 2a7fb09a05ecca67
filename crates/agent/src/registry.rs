use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pagewatch_core::WatchRequest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("a watch is already running for {0}")]
    AlreadyActive(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no active watch for {0}")]
pub struct NoActiveSession(pub String);

/// What the registry knows about a running watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWatch {
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

/// Admission control for watch sessions: at most one per conversation.
///
/// Implementations must make each operation atomic per conversation key.
pub trait SessionRegistry: Send + Sync {
    /// Claim the conversation's slot and hand out a fresh cancellation token.
    fn admit(
        &self,
        conversation: &str,
        request: &WatchRequest,
    ) -> Result<CancellationToken, AdmissionError>;

    /// Request cancellation of the conversation's running watch.
    fn cancel(&self, conversation: &str) -> Result<(), NoActiveSession>;

    /// Free the conversation's slot. Called once per successful `admit`.
    fn release(&self, conversation: &str);

    fn active(&self, conversation: &str) -> Option<ActiveWatch>;

    fn active_count(&self) -> usize;

    /// Cancel every running watch; returns how many were signalled.
    fn cancel_all(&self) -> usize;
}

struct WatchEntry {
    token: CancellationToken,
    url: String,
    started_at: DateTime<Utc>,
}

/// Process-wide registry backed by a sharded concurrent map.
#[derive(Clone, Default)]
pub struct WatchRegistry {
    entries: Arc<DashMap<String, WatchEntry>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for WatchRegistry {
    fn admit(
        &self,
        conversation: &str,
        request: &WatchRequest,
    ) -> Result<CancellationToken, AdmissionError> {
        match self.entries.entry(conversation.to_string()) {
            Entry::Occupied(_) => Err(AdmissionError::AlreadyActive(conversation.to_string())),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(WatchEntry {
                    token: token.clone(),
                    url: request.to_string(),
                    started_at: Utc::now(),
                });
                info!(conversation, url = %request, "Watch admitted");
                Ok(token)
            }
        }
    }

    fn cancel(&self, conversation: &str) -> Result<(), NoActiveSession> {
        match self.entries.get(conversation) {
            Some(entry) => {
                entry.token.cancel();
                info!(conversation, "Watch cancellation requested");
                Ok(())
            }
            None => Err(NoActiveSession(conversation.to_string())),
        }
    }

    fn release(&self, conversation: &str) {
        if self.entries.remove(conversation).is_some() {
            debug!(conversation, "Watch slot released");
        }
    }

    fn active(&self, conversation: &str) -> Option<ActiveWatch> {
        self.entries.get(conversation).map(|e| ActiveWatch {
            url: e.url.clone(),
            started_at: e.started_at,
            cancel_requested: e.token.is_cancelled(),
        })
    }

    fn active_count(&self) -> usize {
        self.entries.len()
    }

    fn cancel_all(&self) -> usize {
        let mut n = 0;
        for entry in self.entries.iter() {
            entry.token.cancel();
            n += 1;
        }
        n
    }
}

/// A claimed registry slot. Dropping the lease releases the slot, so the
/// release happens exactly once on every exit path of the owning task.
pub struct SessionLease {
    registry: Arc<dyn SessionRegistry>,
    conversation: String,
    token: CancellationToken,
}

impl SessionLease {
    pub fn acquire(
        registry: Arc<dyn SessionRegistry>,
        conversation: &str,
        request: &WatchRequest,
    ) -> Result<Self, AdmissionError> {
        let token = registry.admit(conversation, request)?;
        Ok(Self {
            registry,
            conversation: conversation.to_string(),
            token,
        })
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn conversation(&self) -> &str {
        &self.conversation
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.conversation);
    }
}
