use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a one-shot timer.
///
/// Cancelling only stops a timer that has not fired yet. A callback that is
/// already running is not interrupted, so callbacks compare their own id
/// against the handle stored in shared state before acting.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    token: CancellationToken,
}

impl TimerHandle {
    /// Run `callback(id)` once `delay` has elapsed unless cancelled first.
    pub fn schedule<F, Fut>(runtime: &Handle, delay: Duration, callback: F) -> Self
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => callback(id).await,
            }
        });

        Self { id, token }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Disarm the timer. Returns false if it was already cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.token.is_cancelled();
        self.token.cancel();
        first
    }
}

/// Lets the registry fire a job's poll timer immediately.
#[derive(Debug, Clone, Default)]
pub struct PollTrigger(Arc<Notify>);

impl PollTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_now(&self) {
        self.0.notify_one();
    }

    /// Resolves once [`fire_now`](Self::fire_now) has been called. A firing
    /// that happened while nobody was waiting is kept for the next waiter.
    pub async fn fired(&self) {
        self.0.notified().await;
    }
}
