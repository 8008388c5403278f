//! Task identifier to session mapping.
//!
//! The registry owns every [`TransferSession`]. Live tasks are looked up for
//! chunk operations; finished tasks stay around for a bounded history window
//! so their final progress remains queryable, then get evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::session::TransferSession;
use super::{Direction, TaskState};

/// Concurrent map of sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TransferSession>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its task id.
    pub async fn insert(&self, session: Arc<TransferSession>) {
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), session);
    }

    /// Any session with this id, live or finished.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown or evicted ids.
    pub async fn get(&self, task_id: &str) -> Result<Arc<TransferSession>> {
        self.sessions
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// A live session of the given direction.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] for unknown ids, finished tasks and tasks of
    /// the other direction.
    pub async fn get_live(&self, task_id: &str, direction: Direction) -> Result<Arc<TransferSession>> {
        let session = self.get(task_id).await?;
        if session.direction() != direction || session.state().await.is_terminal() {
            return Err(Error::TaskNotFound(task_id.to_string()));
        }
        Ok(session)
    }

    /// Drop a session immediately.
    pub async fn remove(&self, task_id: &str) -> Option<Arc<TransferSession>> {
        self.sessions.write().await.remove(task_id)
    }

    /// Snapshot of all registered sessions.
    pub async fn all(&self) -> Vec<Arc<TransferSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Sessions that have not reached a terminal state.
    pub async fn live(&self) -> Vec<Arc<TransferSession>> {
        let mut live = Vec::new();
        for session in self.all().await {
            if !session.state().await.is_terminal() {
                live.push(session);
            }
        }
        live
    }

    /// Number of live sessions.
    pub async fn live_count(&self) -> usize {
        self.live().await.len()
    }

    /// Bytes reserved on disk by live uploads.
    pub async fn reserved_bytes(&self) -> u64 {
        self.live()
            .await
            .iter()
            .filter(|s| s.direction() == Direction::Upload)
            .map(|s| s.task().total_size)
            .sum()
    }

    /// Whether a live upload already targets `path`.
    pub async fn upload_targets(&self, path: &std::path::Path) -> bool {
        self.live()
            .await
            .iter()
            .any(|s| s.direction() == Direction::Upload && s.task().path == path)
    }

    /// Id of a live session of either direction working on `path`.
    pub async fn live_on(&self, path: &std::path::Path) -> Option<String> {
        self.live()
            .await
            .into_iter()
            .find(|s| s.task().path == path)
            .map(|s| s.id().to_string())
    }

    /// Fail live sessions idle for longer than `ttl` and drop them.
    ///
    /// Idleness is re-checked under each session's lock, so a chunk that
    /// arrived after the scan started keeps its task alive. Expired tasks
    /// are unknown from then on, like cancelled ones.
    pub async fn expire_idle(&self, ttl: Duration) -> Vec<Arc<TransferSession>> {
        let now = Instant::now();
        let mut expired = Vec::new();

        for session in self.all().await {
            let mut inner = session.lock().await;
            if !TransferSession::is_idle(&inner, now, ttl) {
                continue;
            }
            inner.failure = Some(format!("idle for more than {}s", ttl.as_secs()));
            if session.transition(&mut inner, TaskState::Failed).is_ok() {
                tracing::info!(task_id = %session.id(), "Task expired");
                drop(inner);
                expired.push(session);
            }
        }

        if !expired.is_empty() {
            let mut sessions = self.sessions.write().await;
            for session in &expired {
                sessions.remove(session.id());
            }
        }
        expired
    }

    /// Evict finished sessions older than `retention`. Returns how many went.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut stale = Vec::new();

        for session in self.all().await {
            let inner = session.lock().await;
            if inner
                .finished_at
                .is_some_and(|t| now.saturating_duration_since(t) >= retention)
            {
                stale.push(session.id().to_string());
            }
        }

        if stale.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        for id in &stale {
            sessions.remove(id);
        }
        stale.len()
    }

    /// Number of registered sessions, live or finished.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
