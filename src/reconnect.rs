//! Bounded exponential-backoff recovery.
//!
//! At most one attempt is scheduled or in flight at a time. The attempt
//! counter is owned here: the connection manager can ask for a reset but never
//! writes it directly.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::error::SyncError;
use crate::events::ReconnectReason;

/// Result of one reconnect attempt.
#[derive(Debug)]
pub enum ReopenOutcome {
    /// Transport reopened and subscriptions restored.
    Restored,
    /// The client left the reconnecting state while the attempt was pending.
    Abandoned,
    /// The transport could not be reopened.
    Failed(SyncError),
}

/// What the scheduler drives. Implemented by the connection manager.
#[async_trait]
pub trait ReconnectTarget: Send + Sync {
    /// An attempt was scheduled.
    fn reconnecting(&self, attempt: u32, delay: Duration, reason: &ReconnectReason);

    /// Reopens the transport and restores prior subscriptions.
    async fn reopen(&self) -> ReopenOutcome;

    /// Recovery gave up after `attempts` attempts.
    fn exhausted(&self, attempts: u32);
}

/// What [`ReconnectScheduler::trigger`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// An attempt was already scheduled or in flight.
    AlreadyPending,
    /// A new attempt was scheduled.
    Scheduled {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt fires.
        delay: Duration,
    },
    /// The attempt budget is spent.
    Exhausted,
}

struct Pending {
    generation: u64,
    cancel: CancellationToken,
}

/// Schedules reconnect attempts with exponential backoff.
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
    generation: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("policy", &self.policy)
            .field("attempts", &self.attempts())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl ReconnectScheduler {
    /// Creates an idle scheduler.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
        })
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Returns true while an attempt is scheduled or in flight.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Starts recovery unless an attempt is already pending.
    pub fn trigger(
        self: &Arc<Self>,
        target: Arc<dyn ReconnectTarget>,
        reason: ReconnectReason,
    ) -> TriggerOutcome {
        let (generation, cancel, attempt) = {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                tracing::debug!(?reason, "reconnect already pending");
                return TriggerOutcome::AlreadyPending;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > self.policy.max_attempts {
                self.attempts.store(self.policy.max_attempts, Ordering::Release);
                drop(pending);
                tracing::error!(
                    max_attempts = self.policy.max_attempts,
                    "max reconnection attempts reached"
                );
                target.exhausted(self.policy.max_attempts);
                return TriggerOutcome::Exhausted;
            }

            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let cancel = CancellationToken::new();
            *pending = Some(Pending {
                generation,
                cancel: cancel.clone(),
            });
            (generation, cancel, attempt)
        };

        let delay = self.policy.delay_for_attempt(attempt);
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            ?reason,
            "scheduling reconnect"
        );
        target.reconnecting(attempt, delay, &reason);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                outcome = target.reopen() => outcome,
            };
            if !scheduler.finish(generation) {
                return;
            }

            match outcome {
                ReopenOutcome::Restored => {
                    tracing::info!(attempt, "reconnected");
                    scheduler.attempts.store(0, Ordering::Release);
                }
                ReopenOutcome::Abandoned => {
                    tracing::debug!(attempt, "reconnect abandoned");
                }
                ReopenOutcome::Failed(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    scheduler.trigger(target, ReconnectReason::RetryAfterFailure);
                }
            }
        });

        TriggerOutcome::Scheduled { attempt, delay }
    }

    /// Clears the pending slot if it still belongs to `generation`.
    fn finish(&self, generation: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(p) if p.generation == generation => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    /// Cancels any pending attempt.
    pub fn cancel(&self) {
        if let Some(p) = self.pending.lock().take() {
            p.cancel.cancel();
            tracing::debug!("pending reconnect cancelled");
        }
    }

    /// Cancels any pending attempt and zeroes the attempt counter.
    pub fn reset(&self) {
        self.cancel();
        self.attempts.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::error::TransportError;

    #[derive(Default)]
    struct FakeTarget {
        outcomes: Mutex<VecDeque<bool>>,
        scheduled: Mutex<Vec<(u32, Duration)>>,
        reopen_at: Mutex<Vec<Instant>>,
        exhausted: Mutex<Option<u32>>,
    }

    impl FakeTarget {
        fn with_outcomes(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl ReconnectTarget for FakeTarget {
        fn reconnecting(&self, attempt: u32, delay: Duration, _reason: &ReconnectReason) {
            self.scheduled.lock().push((attempt, delay));
        }

        async fn reopen(&self) -> ReopenOutcome {
            self.reopen_at.lock().push(Instant::now());
            if self.outcomes.lock().pop_front().unwrap_or(false) {
                ReopenOutcome::Restored
            } else {
                ReopenOutcome::Failed(SyncError::TransportOpen(TransportError::ConnectionFailed {
                    message: "refused".to_string(),
                }))
            }
        }

        fn exhausted(&self, attempts: u32) {
            *self.exhausted.lock() = Some(attempts);
        }
    }

    fn delays(target: &FakeTarget) -> Vec<u64> {
        target
            .scheduled
            .lock()
            .iter()
            .map(|(_, d)| u64::try_from(d.as_millis()).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_then_exhausted() {
        let scheduler = ReconnectScheduler::new(ReconnectPolicy::default());
        let target = FakeTarget::with_outcomes(&[]);
        let start = Instant::now();

        scheduler.trigger(target.clone(), ReconnectReason::Stale);
        sleep(Duration::from_secs(60)).await;

        assert_eq!(delays(&target), vec![1000, 2000, 4000, 8000, 16000]);
        let offsets: Vec<u64> = target
            .reopen_at
            .lock()
            .iter()
            .map(|t| u64::try_from((*t - start).as_millis()).unwrap())
            .collect();
        assert_eq!(offsets, vec![1000, 3000, 7000, 15000, 31000]);
        assert_eq!(*target.exhausted.lock(), Some(5));
        assert_eq!(scheduler.attempts(), 5);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let scheduler = ReconnectScheduler::new(ReconnectPolicy::default());
        let target = FakeTarget::with_outcomes(&[false, true]);

        scheduler.trigger(target.clone(), ReconnectReason::Stale);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(target.reopen_at.lock().len(), 2);

        scheduler.trigger(target.clone(), ReconnectReason::Stale);
        assert_eq!(target.scheduled.lock().last(), Some(&(1, Duration::from_millis(1000))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_while_pending_is_noop() {
        let scheduler = ReconnectScheduler::new(ReconnectPolicy::default());
        let target = FakeTarget::with_outcomes(&[true]);

        assert!(matches!(
            scheduler.trigger(target.clone(), ReconnectReason::Stale),
            TriggerOutcome::Scheduled { attempt: 1, .. }
        ));
        assert_eq!(
            scheduler.trigger(target.clone(), ReconnectReason::Stale),
            TriggerOutcome::AlreadyPending
        );
        sleep(Duration::from_secs(5)).await;
        assert_eq!(target.reopen_at.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_attempt() {
        let scheduler = ReconnectScheduler::new(ReconnectPolicy::default());
        let target = FakeTarget::with_outcomes(&[true]);

        scheduler.trigger(target.clone(), ReconnectReason::Stale);
        scheduler.cancel();
        sleep(Duration::from_secs(5)).await;

        assert!(target.reopen_at.lock().is_empty());
        assert!(!scheduler.is_pending());
        assert_eq!(scheduler.attempts(), 1);
        scheduler.reset();
        assert_eq!(scheduler.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_caps_backoff() {
        let policy = ReconnectPolicy {
            max_delay_ms: Some(3000),
            ..ReconnectPolicy::default()
        };
        let scheduler = ReconnectScheduler::new(policy);
        let target = FakeTarget::with_outcomes(&[]);

        scheduler.trigger(target.clone(), ReconnectReason::Stale);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(delays(&target), vec![1000, 2000, 3000, 3000, 3000]);
    }
}
