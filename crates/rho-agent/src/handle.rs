//! A cloneable handle for steering or aborting runs from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

use crate::steering::{SteeringCoordinator, SteeringMode, SteeringRequest};

/// A cloneable handle for poking the orchestrator from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct GenerationHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) steering: SteeringCoordinator,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl GenerationHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            steering: SteeringCoordinator::new(),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the current run without a steering reason.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Submit a steering request to the current run.
    pub fn steer(&self, mode: SteeringMode) -> SteeringRequest {
        self.steering.submit(mode)
    }

    /// The steering mailbox shared with the loop.
    pub fn steering(&self) -> &SteeringCoordinator {
        &self.steering
    }

    /// Fresh token for a new run; the previous run's token is left as is.
    pub(crate) fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        self.steering.clear();
        self.is_running.store(true, Ordering::Release);
        token
    }

    pub(crate) fn end_run(&self) {
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    /// Wait until no run is in progress.
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until no run is in progress, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}
