//! Session lifecycle and the zero-viewer grace timer.
//!
//! ```text
//!   ACTIVE ──last viewer leaves──▶ GRACE ──timer fires, still 0 viewers──▶ TORN_DOWN
//!     ▲                              │
//!     └────────viewer attaches───────┘        (process exit: any state ──▶ TORN_DOWN)
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// At least one viewer is attached.
    Active,
    /// No viewers; the cleanup timer is running.
    Grace,
    /// The process is gone and the session left the registry.
    TornDown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Grace => write!(f, "grace"),
            LifecycleState::TornDown => write!(f, "torn-down"),
        }
    }
}

/// A pending cleanup, cancelled when a viewer re-attaches.
#[derive(Debug)]
pub struct CleanupTimer {
    id: u64,
    token: CancellationToken,
    deadline: Instant,
}

impl CleanupTimer {
    /// Runs `on_expire` after `delay` unless cancelled first.
    ///
    /// `on_expire` must re-validate the session under the registry lock:
    /// cancellation can race with a timer that has already woken up.
    pub fn schedule<F, Fut>(id: u64, delay: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let deadline = Instant::now() + delay;

        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::trace!(timer_id = id, "Cleanup timer cancelled");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    on_expire().await;
                }
            }
        });

        Self {
            id,
            token,
            deadline,
        }
    }

    /// Timer identifier, unique within a registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the timer fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the timer fires.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Stops the timer. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
