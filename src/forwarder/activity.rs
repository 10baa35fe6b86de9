//! Activity-based cancellation.
//!
//! # Responsibilities
//! - Cancel a forwarding attempt after a period with no I/O progress
//! - Propagate the client's own cancellation and remember that it happened
//! - Recycle the underlying cancellation state between requests
//!
//! # Design Decisions
//! - One watchdog task per rental sleeps until the current deadline; resets only
//!   move the deadline, the watchdog re-checks it when it wakes
//! - The owner (`ActivityCancellation`) is not `Clone` and is consumed on return;
//!   copies hand out `ActivityToken` handles instead
//! - State is only pooled when it was never cancelled and no handle outlives the
//!   rental, so a recycled token can never be observed through a stale handle
//! - Every mutation is tagged with a rental generation; stale handles are inert

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Idle timeout used when a request config does not name one.
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(100);

const MAX_POOLED: usize = 1024;

struct LeaseState {
    generation: u64,
    timeout: Duration,
    deadline: Instant,
    linked_cancel: bool,
    returned: bool,
}

struct Shared {
    token: CancellationToken,
    state: Mutex<LeaseState>,
    handles: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            state: Mutex::new(LeaseState {
                generation: 0,
                timeout: DEFAULT_ACTIVITY_TIMEOUT,
                deadline: Instant::now(),
                linked_cancel: false,
                returned: true,
            }),
            handles: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current deadline if `generation` is still the live rental.
    fn deadline_for(&self, generation: u64) -> Option<Instant> {
        let state = self.lock();
        (state.generation == generation && !state.returned).then_some(state.deadline)
    }

    fn cancel_for(&self, generation: u64, linked: bool) {
        let mut state = self.lock();
        if state.generation != generation || state.returned {
            return;
        }
        if linked && !self.token.is_cancelled() {
            state.linked_cancel = true;
        }
        self.token.cancel();
    }

    /// Called when the watchdog wakes. Returns true once the watchdog can stop.
    fn expire(&self, generation: u64) -> bool {
        let state = self.lock();
        if state.generation != generation || state.returned {
            return true;
        }
        if Instant::now() >= state.deadline {
            self.token.cancel();
            return true;
        }
        false
    }
}

/// Pool of reusable cancellation state.
#[derive(Default)]
pub struct ActivityTimeoutPool {
    idle: Mutex<Vec<Arc<Shared>>>,
}

impl ActivityTimeoutPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rent a cancellation source that fires after `timeout` without a reset, or as
    /// soon as `linked` is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn rent(self: &Arc<Self>, timeout: Duration, linked: &CancellationToken) -> ActivityCancellation {
        let shared = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Arc::new(Shared::new()));

        let generation = {
            let mut state = shared.lock();
            state.timeout = timeout;
            state.deadline = Instant::now() + timeout;
            state.linked_cancel = false;
            state.returned = false;
            state.generation
        };

        let watchdog = tokio::spawn(watchdog(shared.clone(), generation, linked.clone()));
        shared.handles.fetch_add(1, Ordering::AcqRel);

        ActivityCancellation {
            handle: ActivityToken { shared, generation },
            watchdog,
            pool: self.clone(),
        }
    }

    /// Number of idle entries ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn give_back(&self, shared: Arc<Shared>) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_POOLED {
            idle.push(shared);
        }
    }
}

async fn watchdog(shared: Arc<Shared>, generation: u64, linked: CancellationToken) {
    loop {
        let Some(deadline) = shared.deadline_for(generation) else {
            return;
        };

        tokio::select! {
            _ = shared.token.cancelled() => return,
            _ = linked.cancelled() => {
                shared.cancel_for(generation, true);
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                if shared.expire(generation) {
                    return;
                }
            }
        }
    }
}

/// Cloneable view of a rental, handed to body copies and the duplex pump.
pub struct ActivityToken {
    shared: Arc<Shared>,
    generation: u64,
}

impl ActivityToken {
    /// Push the idle deadline out by the full timeout.
    pub fn reset_timeout(&self) {
        let mut state = self.shared.lock();
        if state.generation == self.generation && !state.returned {
            state.deadline = Instant::now() + state.timeout;
        }
    }

    /// Cancel immediately.
    pub fn cancel(&self) {
        self.shared.cancel_for(self.generation, false);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// True when cancellation came from the linked (client) token.
    pub fn cancelled_by_linked_token(&self) -> bool {
        let state = self.shared.lock();
        state.generation == self.generation && state.linked_cancel
    }
}

impl Clone for ActivityToken {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
            generation: self.generation,
        }
    }
}

impl Drop for ActivityToken {
    fn drop(&mut self) {
        self.shared.handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ActivityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityToken")
            .field("generation", &self.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Owner of a rental. Return it with [`ActivityCancellation::return_to_pool`].
pub struct ActivityCancellation {
    handle: ActivityToken,
    watchdog: JoinHandle<()>,
    pool: Arc<ActivityTimeoutPool>,
}

impl ActivityCancellation {
    /// The owner's own handle; clone it to share.
    pub fn handle(&self) -> &ActivityToken {
        &self.handle
    }

    pub fn reset_timeout(&self) {
        self.handle.reset_timeout();
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        self.handle.token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn cancelled_by_linked_token(&self) -> bool {
        self.handle.cancelled_by_linked_token()
    }

    /// Stop the timer, detach the linked token and recycle the state if possible.
    pub fn return_to_pool(self) {
        self.watchdog.abort();
        let shared = self.handle.shared.clone();

        let reusable = {
            let mut state = shared.lock();
            state.returned = true;
            state.generation = state.generation.wrapping_add(1);
            !shared.token.is_cancelled() && shared.handles.load(Ordering::Acquire) == 1
        };

        if reusable {
            self.pool.give_back(shared);
        }
    }
}

impl Drop for ActivityCancellation {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn fires_after_idle_timeout() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(!activity.is_cancelled());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(activity.is_cancelled());
        assert!(!activity.cancelled_by_linked_token());
        activity.return_to_pool();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pushes_the_deadline_out() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        let handle = activity.handle().clone();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            handle.reset_timeout();
        }
        assert!(!activity.is_cancelled());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(handle.is_cancelled());
        drop(handle);
        activity.return_to_pool();
    }

    #[tokio::test(start_paused = true)]
    async fn linked_cancellation_is_remembered() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let client = CancellationToken::new();
        let activity = pool.rent(TIMEOUT, &client);

        client.cancel();
        activity.token().cancelled().await;
        assert!(activity.cancelled_by_linked_token());
        activity.return_to_pool();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_link_cancels_at_rent() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let client = CancellationToken::new();
        client.cancel();

        let activity = pool.rent(TIMEOUT, &client);
        activity.token().cancelled().await;
        assert!(activity.cancelled_by_linked_token());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_is_not_linked() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        activity.cancel();
        assert!(activity.is_cancelled());
        assert!(!activity.cancelled_by_linked_token());
    }

    #[tokio::test(start_paused = true)]
    async fn clean_rentals_are_reused() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        let first = Arc::as_ptr(&activity.handle().shared);
        activity.return_to_pool();
        assert_eq!(pool.idle_count(), 1);

        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        assert_eq!(Arc::as_ptr(&activity.handle().shared), first);
        assert_eq!(pool.idle_count(), 0);

        // The recycled entry keeps timing out normally.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(activity.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_handles_prevent_reuse_and_go_inert() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let client = CancellationToken::new();
        let activity = pool.rent(TIMEOUT, &client);
        let stale = activity.handle().clone();
        activity.return_to_pool();
        assert_eq!(pool.idle_count(), 0);

        // Neither the timer nor the old link fire after return.
        stale.reset_timeout();
        client.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!stale.is_cancelled());

        stale.cancel();
        assert!(!stale.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_does_not_fire_after_return() {
        let pool = Arc::new(ActivityTimeoutPool::new());
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        activity.return_to_pool();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let activity = pool.rent(TIMEOUT, &CancellationToken::new());
        assert!(!activity.is_cancelled());
    }
}
