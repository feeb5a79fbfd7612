//! User steering of an in-progress run
//!
//! A single-slot mailbox: the latest submission replaces any pending one,
//! and the loop consumes it at iteration boundaries.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// How the user wants to influence the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SteeringMode {
    /// Finish the current step, then stop
    SoftInterrupt,
    /// Abort the current stream now
    HardStop,
    /// Abandon the current line of work and continue with a new prompt
    Redirect { prompt: String },
}

impl SteeringMode {
    pub fn redirect(prompt: impl Into<String>) -> Self {
        SteeringMode::Redirect {
            prompt: prompt.into(),
        }
    }
}

/// A submitted steering instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteeringRequest {
    pub id: Uuid,
    pub mode: SteeringMode,
    pub created_at: DateTime<Utc>,
}

impl SteeringRequest {
    fn new(mode: SteeringMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            created_at: Utc::now(),
        }
    }
}

/// Holds at most one pending [`SteeringRequest`]
///
/// Cloning is cheap; clones share the same mailbox.
#[derive(Clone, Default)]
pub struct SteeringCoordinator {
    pending: Arc<Mutex<Option<SteeringRequest>>>,
    notify: Arc<Notify>,
}

impl SteeringCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request, replacing any pending one
    pub fn submit(&self, mode: SteeringMode) -> SteeringRequest {
        let request = SteeringRequest::new(mode);
        let replaced = self.pending.lock().replace(request.clone());
        if let Some(old) = replaced {
            tracing::debug!("Steering request {} replaced by {}", old.id, request.id);
        }
        self.notify.notify_waiters();
        request
    }

    /// Take the pending request, leaving the slot empty
    pub fn consume(&self) -> Option<SteeringRequest> {
        self.pending.lock().take()
    }

    /// Peek at the pending request without consuming it
    pub fn current_request(&self) -> Option<SteeringRequest> {
        self.pending.lock().clone()
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Discard the pending request without acting on it
    pub fn clear(&self) {
        self.pending.lock().take();
    }

    /// True only for a pending hard stop
    pub fn should_interrupt_immediately(&self) -> bool {
        matches!(
            self.pending.lock().as_ref().map(|r| &r.mode),
            Some(SteeringMode::HardStop)
        )
    }

    /// True for a pending hard stop or redirect
    pub fn should_skip_remaining_tools(&self) -> bool {
        matches!(
            self.pending.lock().as_ref().map(|r| &r.mode),
            Some(SteeringMode::HardStop | SteeringMode::Redirect { .. })
        )
    }

    /// Resolves on the next submission
    ///
    /// Create the future before checking state to avoid missing a submit
    /// that lands in between.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hard_stop_flags() {
        let steering = SteeringCoordinator::new();
        steering.submit(SteeringMode::HardStop);
        assert!(steering.should_interrupt_immediately());
        assert!(steering.should_skip_remaining_tools());
    }

    #[test]
    fn test_soft_interrupt_flags() {
        let steering = SteeringCoordinator::new();
        steering.submit(SteeringMode::SoftInterrupt);
        assert!(!steering.should_interrupt_immediately());
        assert!(!steering.should_skip_remaining_tools());
    }

    #[test]
    fn test_redirect_flags() {
        let steering = SteeringCoordinator::new();
        steering.submit(SteeringMode::redirect("try again"));
        assert!(!steering.should_interrupt_immediately());
        assert!(steering.should_skip_remaining_tools());
    }

    #[test]
    fn test_consume_exactly_once() {
        let steering = SteeringCoordinator::new();
        let submitted = steering.submit(SteeringMode::HardStop);
        assert_eq!(steering.consume(), Some(submitted));
        assert_eq!(steering.consume(), None);
        assert!(!steering.should_interrupt_immediately());
    }

    #[test]
    fn test_latest_submission_wins() {
        let steering = SteeringCoordinator::new();
        steering.submit(SteeringMode::HardStop);
        let latest = steering.submit(SteeringMode::redirect("new"));
        assert_eq!(steering.current_request(), Some(latest.clone()));
        assert_eq!(steering.consume(), Some(latest));
        assert!(steering.consume().is_none());
    }

    #[test]
    fn test_peek_does_not_clear() {
        let steering = SteeringCoordinator::new();
        steering.submit(SteeringMode::SoftInterrupt);
        assert!(steering.has_pending_request());
        assert!(steering.current_request().is_some());
        assert!(steering.has_pending_request());
        steering.clear();
        assert!(!steering.has_pending_request());
    }

    #[tokio::test]
    async fn test_notified_wakes_on_submit() {
        let steering = SteeringCoordinator::new();
        let remote = steering.clone();
        let waiter = tokio::spawn(async move {
            let notified = remote.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            notified.await;
            remote.current_request()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        steering.submit(SteeringMode::HardStop);
        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.map(|r| r.mode), Some(SteeringMode::HardStop));
    }

    #[tokio::test]
    async fn test_concurrent_submits_leave_one_request() {
        let steering = SteeringCoordinator::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let s = steering.clone();
                tokio::spawn(async move { s.submit(SteeringMode::redirect(format!("p{}", i))) })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert!(steering.consume().is_some());
        assert!(steering.consume().is_none());
    }
}
