//! Connection liveness detection.
//!
//! The transport does not always report a dead link. The monitor infers one
//! from the absence of inbound traffic: every routed message refreshes the
//! last-activity timestamp, and a periodic check fires once when the client is
//! connected but has been quiet for longer than the stale threshold.
//!
//! A live connection that is legitimately quiet for longer than the threshold
//! will be treated as stale; tune [`HeartbeatConfig`] to the protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::state::{ConnectionState, StateCell};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Periodic staleness check.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: StateCell,
    last_activity: Mutex<Instant>,
    triggered: AtomicBool,
    running: Mutex<Option<Running>>,
    this: Weak<Self>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("config", &self.config)
            .field("idle", &self.idle())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor that reads the connection state from `state`.
    #[must_use]
    pub fn new(config: HeartbeatConfig, state: StateCell) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            state,
            last_activity: Mutex::new(Instant::now()),
            triggered: AtomicBool::new(false),
            running: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Starts the periodic check, replacing any running one.
    ///
    /// `on_stale` receives the observed idle time. It runs on the monitor's
    /// task and must not block.
    pub fn start(&self, on_stale: impl Fn(Duration) + Send + Sync + 'static) {
        self.stop();
        self.record_activity();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor = self.this.clone();
        let period = self.config.check_interval();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                if let Some(idle) = monitor.check() {
                    on_stale(idle);
                }
            }
        });

        tracing::debug!(
            check_interval_ms = self.config.check_interval_ms,
            stale_threshold_ms = self.config.stale_threshold_ms,
            "heartbeat started"
        );
        *self.running.lock() = Some(Running { cancel, task });
    }

    /// Stops the periodic check. Stopping a stopped monitor is a no-op.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            running.task.abort();
            tracing::debug!("heartbeat stopped");
        }
    }

    /// Returns true while the periodic check is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Refreshes the last-activity timestamp and re-arms the trigger.
    pub fn record_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        self.triggered.store(false, Ordering::Release);
    }

    /// Re-arms the trigger without touching the timestamp.
    ///
    /// Called when a reconnect attempt starts.
    pub fn rearm(&self) {
        self.triggered.store(false, Ordering::Release);
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Runs one staleness check. Returns the idle time if this call fired.
    pub(crate) fn check(&self) -> Option<Duration> {
        if self.state.get() != ConnectionState::Connected {
            return None;
        }
        let idle = self.idle();
        if idle <= self.config.stale_threshold() {
            return None;
        }
        if self.triggered.swap(true, Ordering::AcqRel) {
            return None;
        }
        tracing::warn!(
            idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
            "connection stale"
        );
        Some(idle)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
