//! Per-task session state.
//!
//! A [`TransferSession`] pairs the immutable [`TransferTask`] with the mutable
//! part (state, coverage, progress) behind one async mutex. The mutex is only
//! held for bookkeeping, never across storage I/O: callers check the state,
//! release the lock, do the I/O, then re-check the state when recording the
//! range.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{Error, Result};

use super::messages::ChunkAck;
use super::progress::{percent, ProgressSnapshot, ProgressTracker};
use super::range::ReceivedRangeSet;
use super::{Direction, TaskState, TransferTask};

/// Mutable part of a session.
#[derive(Debug)]
pub struct SessionInner {
    /// Lifecycle state
    pub state: TaskState,
    /// Coverage
    pub ranges: ReceivedRangeSet,
    /// Progress counters
    pub tracker: ProgressTracker,
    /// Highest sequence number seen
    pub last_sequence: Option<u64>,
    /// Last chunk or control activity
    pub last_activity: Instant,
    /// Wall-clock time of the last change
    pub updated_at: DateTime<Utc>,
    /// When the task reached a terminal state
    pub finished_at: Option<Instant>,
    /// Why the task failed
    pub failure: Option<String>,
}

/// A registered transfer task.
#[derive(Debug)]
pub struct TransferSession {
    task: TransferTask,
    inner: Mutex<SessionInner>,
    permits: Arc<Semaphore>,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl TransferSession {
    /// Create a `Pending` session with the given initial coverage.
    #[must_use]
    pub fn new(task: TransferTask, ranges: ReceivedRangeSet, speed_window: Duration) -> Self {
        let tracker = ProgressTracker::new(task.total_size, ranges.covered(), speed_window);
        let snapshot = tracker.snapshot(&task.task_id, task.direction, TaskState::Pending);
        let (progress_tx, _) = watch::channel(snapshot);
        let permits = Arc::new(Semaphore::new(task.options.threads()));

        Self {
            task,
            inner: Mutex::new(SessionInner {
                state: TaskState::Pending,
                ranges,
                tracker,
                last_sequence: None,
                last_activity: Instant::now(),
                updated_at: Utc::now(),
                finished_at: None,
                failure: None,
            }),
            permits,
            progress_tx,
        }
    }

    /// Task metadata.
    #[must_use]
    pub const fn task(&self) -> &TransferTask {
        &self.task
    }

    /// Task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.task.task_id
    }

    /// Transfer direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.task.direction
    }

    /// Lock the mutable state.
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }

    /// Current state.
    pub async fn state(&self) -> TaskState {
        self.inner.lock().await.state
    }

    /// Current progress.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.lock().await;
        self.snapshot_of(&inner)
    }

    /// Receiver of progress updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress_tx.subscribe()
    }

    /// Snapshot of an already locked state.
    #[must_use]
    pub fn snapshot_of(&self, inner: &SessionInner) -> ProgressSnapshot {
        inner
            .tracker
            .snapshot(&self.task.task_id, self.task.direction, inner.state)
    }

    /// Push the current snapshot to subscribers.
    pub fn publish(&self, inner: &SessionInner) {
        self.progress_tx.send_replace(self.snapshot_of(inner));
    }

    /// Take one admission permit without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when `threads` operations are in flight,
    /// [`Error::TaskNotFound`] once the session has been closed.
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => Error::Busy {
                    task_id: self.task.task_id.clone(),
                    limit: self.task.options.threads(),
                },
                TryAcquireError::Closed => Error::TaskNotFound(self.task.task_id.clone()),
            })
    }

    /// Wait until every in-flight chunk operation has finished and hold all permits.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] if the session is closed while waiting.
    pub async fn drain(&self) -> Result<OwnedSemaphorePermit> {
        let all = u32::try_from(self.task.options.threads()).unwrap_or(u32::MAX);
        Arc::clone(&self.permits)
            .acquire_many_owned(all)
            .await
            .map_err(|_| Error::TaskNotFound(self.task.task_id.clone()))
    }

    /// Refuse all future admissions and wake drainers.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Fail unless the session accepts chunk operations.
    ///
    /// # Errors
    ///
    /// [`Error::TaskPaused`] while paused, [`Error::TaskNotFound`] otherwise.
    pub fn ensure_accepting(&self, inner: &SessionInner) -> Result<()> {
        match inner.state {
            TaskState::Active => Ok(()),
            TaskState::Paused => Err(Error::TaskPaused(self.task.task_id.clone())),
            _ => Err(Error::TaskNotFound(self.task.task_id.clone())),
        }
    }

    /// Move to `next`, publishing the change.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`] from a terminal state, [`Error::InvalidRequest`]
    /// for any other transition the state machine does not define.
    pub fn transition(&self, inner: &mut SessionInner, next: TaskState) -> Result<()> {
        if !inner.state.can_transition_to(next) {
            if inner.state.is_terminal() {
                return Err(Error::TaskNotFound(self.task.task_id.clone()));
            }
            return Err(Error::InvalidRequest(format!(
                "task {} cannot move from {} to {next}",
                self.task.task_id, inner.state
            )));
        }

        tracing::debug!(
            task_id = %self.task.task_id,
            from = %inner.state,
            to = %next,
            "Task state change"
        );

        inner.state = next;
        inner.updated_at = Utc::now();
        inner.last_activity = Instant::now();
        if next.is_terminal() {
            inner.finished_at = Some(Instant::now());
            self.close();
        }
        self.publish(inner);
        Ok(())
    }

    /// Record a durably written range and build the acknowledgement.
    ///
    /// Re-checks the state first, so a range written while the task was being
    /// cancelled is never acknowledged.
    ///
    /// # Errors
    ///
    /// Fails like [`TransferSession::ensure_accepting`].
    pub fn record_range(
        &self,
        inner: &mut SessionInner,
        offset: u64,
        len: u64,
        sequence: u64,
    ) -> Result<ChunkAck> {
        self.ensure_accepting(inner)?;

        let added = inner.ranges.insert(offset, offset + len);
        inner.last_sequence = Some(inner.last_sequence.map_or(sequence, |s| s.max(sequence)));
        inner.last_activity = Instant::now();
        inner.updated_at = Utc::now();
        if added > 0 {
            inner.tracker.record(inner.ranges.covered());
            self.publish(inner);
        }

        Ok(self.ack(inner, sequence, len, added == 0))
    }

    /// Acknowledgement reflecting the current coverage.
    #[must_use]
    pub fn ack(&self, inner: &SessionInner, sequence: u64, len: u64, duplicate: bool) -> ChunkAck {
        let total_received = inner.ranges.covered();
        ChunkAck {
            ack: true,
            task_id: self.task.task_id.clone(),
            sequence,
            received: len,
            total_received,
            progress: percent(total_received, self.task.total_size),
            duplicate,
        }
    }

    /// Note activity without changing coverage.
    pub fn touch(inner: &mut SessionInner) {
        inner.last_activity = Instant::now();
    }

    /// Whether the session has been idle for longer than `ttl` at `now`.
    #[must_use]
    pub fn is_idle(inner: &SessionInner, now: Instant, ttl: Duration) -> bool {
        !inner.state.is_terminal() && now.saturating_duration_since(inner.last_activity) > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferOptions;

    fn session(total: u64, threads: usize) -> TransferSession {
        let task = TransferTask {
            task_id: "task-1".into(),
            direction: Direction::Upload,
            file_name: "f.bin".into(),
            total_size: total,
            chunk_size: 10,
            checksum: None,
            options: TransferOptions {
                threads: Some(threads),
                ..TransferOptions::default()
            },
            content_type: None,
            path: "/tmp/f.bin".into(),
            staging_path: None,
            file_id: None,
            created_at: Utc::now(),
        };
        TransferSession::new(task, ReceivedRangeSet::new(), Duration::from_secs(5))
    }

    async fn activate(session: &TransferSession) {
        let mut inner = session.lock().await;
        session.transition(&mut inner, TaskState::Active).unwrap();
    }

    #[tokio::test]
    async fn test_starts_pending() {
        let session = session(100, 2);
        assert_eq!(session.state().await, TaskState::Pending);

        let inner = session.lock().await;
        assert!(matches!(
            session.ensure_accepting(&inner),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_range_acks_and_dedups() {
        let session = session(30, 2);
        activate(&session).await;

        let mut inner = session.lock().await;
        let ack = session.record_range(&mut inner, 10, 10, 1).unwrap();
        assert_eq!(ack.total_received, 10);
        assert_eq!(ack.progress, 33);
        assert!(!ack.duplicate);

        let again = session.record_range(&mut inner, 10, 10, 1).unwrap();
        assert_eq!(again.total_received, 10);
        assert!(again.duplicate);
        assert_eq!(inner.last_sequence, Some(1));
    }

    #[tokio::test]
    async fn test_progress_is_published() {
        let session = session(20, 1);
        let mut rx = session.subscribe();
        activate(&session).await;

        {
            let mut inner = session.lock().await;
            session.record_range(&mut inner, 0, 20, 0).unwrap();
        }

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.transferred, 20);
        assert_eq!(snapshot.progress, 100);
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let session = session(100, 2);
        activate(&session).await;

        let a = session.try_admit().unwrap();
        let _b = session.try_admit().unwrap();
        assert!(matches!(session.try_admit(), Err(Error::Busy { limit: 2, .. })));

        drop(a);
        assert!(session.try_admit().is_ok());
    }

    #[tokio::test]
    async fn test_terminal_state_closes_admission() {
        let session = session(100, 2);
        activate(&session).await;

        {
            let mut inner = session.lock().await;
            session.transition(&mut inner, TaskState::Cancelled).unwrap();
            assert!(inner.finished_at.is_some());
            assert!(matches!(
                session.record_range(&mut inner, 0, 10, 0),
                Err(Error::TaskNotFound(_))
            ));
            assert!(matches!(
                session.transition(&mut inner, TaskState::Active),
                Err(Error::TaskNotFound(_))
            ));
        }

        assert!(matches!(session.try_admit(), Err(Error::TaskNotFound(_))));
        assert!(session.drain().await.is_err());
    }

    #[tokio::test]
    async fn test_paused_rejects_chunks() {
        let session = session(100, 2);
        activate(&session).await;

        let mut inner = session.lock().await;
        session.transition(&mut inner, TaskState::Paused).unwrap();
        assert!(matches!(
            session.record_range(&mut inner, 0, 10, 0),
            Err(Error::TaskPaused(_))
        ));
        assert!(matches!(
            session.transition(&mut inner, TaskState::Completed),
            Err(Error::InvalidRequest(_))
        ));

        session.transition(&mut inner, TaskState::Active).unwrap();
        assert!(session.record_range(&mut inner, 0, 10, 0).is_ok());
    }

    #[tokio::test]
    async fn test_idleness() {
        let session = session(100, 1);
        activate(&session).await;

        let inner = session.lock().await;
        let later = inner.last_activity + Duration::from_secs(120);
        assert!(TransferSession::is_idle(&inner, later, Duration::from_secs(60)));
        assert!(!TransferSession::is_idle(
            &inner,
            inner.last_activity,
            Duration::from_secs(60)
        ));
    }
}
