//! Subscription registry.
//!
//! Owns every logical subscription, keyed by the joined channel set. A
//! channel set is registered with the transport once; subscribing to it again
//! attaches the extra callback to the existing record and returns the same
//! [`Disposer`]. Disposing removes the record and its single transport
//! registration.
//!
//! The record map is only mutated here. The router reads snapshots of it and
//! invokes callbacks outside the lock, so a callback may unsubscribe itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::channel::{ChannelKey, ChannelSet};
use crate::error::{CallbackError, SyncError, SyncResult};
use crate::events::{ClientEvent, EventBus};
use crate::message::InboundEvent;
use crate::transport::{RealtimeTransport, TransportHandle};

/// Outcome of an application callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Callback invoked for every routed message on a channel set.
pub type MessageCallback = Arc<dyn Fn(&InboundEvent) -> CallbackResult + Send + Sync>;

/// Unique identifier for a subscription record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct DisposerState {
    disposed: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

/// Zero-argument handle that reverses one registration.
///
/// Clones share state: whichever clone is disposed first runs the teardown,
/// every later call is a no-op. Dropping a disposer does not dispose it.
#[derive(Clone)]
pub struct Disposer {
    state: Arc<DisposerState>,
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Disposer {
    pub(crate) fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(DisposerState {
                disposed: AtomicBool::new(false),
                action: Box::new(action),
            }),
        }
    }

    /// Runs the teardown. Returns true if this call performed it.
    pub fn dispose(&self) -> bool {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.state.action)();
        true
    }

    /// Returns true once disposed, by this handle, a clone, or a full teardown.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }

    /// Returns true if both handles reverse the same registration.
    #[must_use]
    pub fn same_registration(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Marks disposed without running the action.
    fn retire(&self) {
        self.state.disposed.store(true, Ordering::Release);
    }
}

/// A named callback attached to a subscription.
#[derive(Clone)]
pub struct CallbackSlot {
    /// Name used when reporting failures.
    pub name: String,
    /// The callback.
    pub callback: MessageCallback,
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot").field("name", &self.name).finish()
    }
}

struct SubscriptionRecord {
    id: SubscriptionId,
    channels: ChannelSet,
    callbacks: Vec<CallbackSlot>,
    active: bool,
    handle: Option<TransportHandle>,
    disposer: Disposer,
}

/// Snapshot of a record that matched an inbound message.
#[derive(Debug, Clone)]
pub struct MatchedSubscription {
    /// Record identifier.
    pub id: SubscriptionId,
    /// The record's channel set.
    pub channels: ChannelSet,
    /// Callbacks attached at snapshot time.
    pub callbacks: Vec<CallbackSlot>,
}

/// Result of [`SubscriptionRegistry::restore_all`].
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Records re-registered with the transport.
    pub restored: usize,
    /// One error per channel set that failed and is now inactive.
    pub failed: Vec<SyncError>,
}

impl RestoreReport {
    /// Returns true if every active record was re-registered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the active logical subscriptions.
pub struct SubscriptionRegistry {
    transport: Arc<dyn RealtimeTransport>,
    events: Arc<EventBus>,
    records: RwLock<HashMap<ChannelKey, SubscriptionRecord>>,
    this: Weak<Self>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn RealtimeTransport>, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            events,
            records: RwLock::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Subscribes `callback` to `channels`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Subscription`] if the transport rejects the
    /// registration; the failure is also published on the event bus.
    pub fn subscribe(
        &self,
        channels: &ChannelSet,
        callback: impl Fn(&InboundEvent) -> CallbackResult + Send + Sync + 'static,
    ) -> SyncResult<Disposer> {
        let name = format!("subscription[{}]", channels.key());
        self.subscribe_named(channels, name, Arc::new(callback))
    }

    /// Subscribes a callback with an explicit name for failure reports.
    ///
    /// # Errors
    ///
    /// See [`SubscriptionRegistry::subscribe`].
    pub fn subscribe_named(
        &self,
        channels: &ChannelSet,
        name: impl Into<String>,
        callback: MessageCallback,
    ) -> SyncResult<Disposer> {
        let slot = CallbackSlot {
            name: name.into(),
            callback,
        };
        let key = channels.key();

        let (disposer, registered) = {
            let mut records = self.records.write();
            match records.get_mut(&key) {
                Some(record) if record.active => {
                    tracing::debug!(
                        channels = %key,
                        "channel set already subscribed, attaching callback"
                    );
                    record.callbacks.push(slot);
                    (record.disposer.clone(), false)
                }
                Some(record) => match self.transport.subscribe(channels) {
                    Ok(handle) => {
                        record.handle = Some(handle);
                        record.active = true;
                        record.callbacks.push(slot);
                        (record.disposer.clone(), true)
                    }
                    Err(source) => {
                        drop(records);
                        return Err(self.report_subscription_failure(channels, source));
                    }
                },
                None => match self.transport.subscribe(channels) {
                    Ok(handle) => {
                        let id = SubscriptionId::new();
                        let disposer = self.make_disposer(key.clone(), id);
                        records.insert(
                            key.clone(),
                            SubscriptionRecord {
                                id,
                                channels: channels.clone(),
                                callbacks: vec![slot],
                                active: true,
                                handle: Some(handle),
                                disposer: disposer.clone(),
                            },
                        );
                        (disposer, true)
                    }
                    Err(source) => {
                        drop(records);
                        return Err(self.report_subscription_failure(channels, source));
                    }
                },
            }
        };

        if registered {
            tracing::debug!(channels = %key, "subscribed");
            self.events.emit(ClientEvent::Subscribed {
                channels: channels.clone(),
            });
        }
        Ok(disposer)
    }

    fn make_disposer(&self, key: ChannelKey, id: SubscriptionId) -> Disposer {
        let registry = self.this.clone();
        Disposer::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&key, id);
            }
        })
    }

    fn report_subscription_failure(
        &self,
        channels: &ChannelSet,
        source: crate::error::TransportError,
    ) -> SyncError {
        let err = SyncError::Subscription {
            channels: channels.clone(),
            source,
        };
        tracing::warn!(channels = %channels, error = %err, "subscription failed");
        self.events.emit(ClientEvent::Error(err.clone()));
        err
    }

    /// Reverses the registration behind `disposer`.
    ///
    /// Returns true if this call performed the teardown.
    pub fn unsubscribe(&self, disposer: &Disposer) -> bool {
        disposer.dispose()
    }

    fn remove(&self, key: &ChannelKey, id: SubscriptionId) {
        let removed = {
            let mut records = self.records.write();
            match records.get(key) {
                Some(record) if record.id == id => records.remove(key),
                _ => None,
            }
        };

        if let Some(record) = removed {
            self.release(record);
        }
    }

    /// Drops the transport registration of a removed record.
    ///
    /// Transport failures are logged only: local state is already consistent
    /// and the remote side may simply be unreachable.
    fn release(&self, record: SubscriptionRecord) {
        record.disposer.retire();
        if let Some(handle) = record.handle {
            if let Err(e) = self.transport.unsubscribe(handle) {
                tracing::warn!(
                    channels = %record.channels,
                    error = %e,
                    "transport unsubscribe failed"
                );
            }
        }
        tracing::debug!(channels = %record.channels, "unsubscribed");
        self.events.emit(ClientEvent::Unsubscribed {
            channels: record.channels,
        });
    }

    /// Tears down every record. One failing unsubscribe does not stop the rest.
    pub fn teardown_all(&self) -> usize {
        let drained: Vec<SubscriptionRecord> =
            self.records.write().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for record in drained {
            self.release(record);
        }
        count
    }

    /// Re-issues transport registration for every active record.
    ///
    /// Callbacks are kept; only the transport linkage is recreated. Records
    /// that fail are marked inactive and reported, successes are not rolled back.
    pub fn restore_all(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        {
            let mut records = self.records.write();
            for record in records.values_mut().filter(|r| r.active) {
                match self.transport.subscribe(&record.channels) {
                    Ok(handle) => {
                        record.handle = Some(handle);
                        report.restored += 1;
                    }
                    Err(source) => {
                        record.active = false;
                        record.handle = None;
                        report.failed.push(SyncError::Subscription {
                            channels: record.channels.clone(),
                            source,
                        });
                    }
                }
            }
        }

        tracing::info!(
            restored = report.restored,
            failed = report.failed.len(),
            "restored subscriptions"
        );
        for err in &report.failed {
            tracing::warn!(error = %err, "failed to restore subscription");
            self.events.emit(ClientEvent::Error(err.clone()));
        }
        report
    }

    /// Forgets transport handles after the connection was lost.
    pub(crate) fn detach_transport(&self) {
        for record in self.records.write().values_mut() {
            record.handle = None;
        }
    }

    /// Active records whose channel set contains any of `channels`.
    #[must_use]
    pub fn matching<'a, I>(&self, channels: I) -> Vec<MatchedSubscription>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.records
            .read()
            .values()
            .filter(|r| r.active && r.channels.intersects(channels.clone()))
            .map(|r| MatchedSubscription {
                id: r.id,
                channels: r.channels.clone(),
                callbacks: r.callbacks.clone(),
            })
            .collect()
    }

    /// Number of records, active or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of active records.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.records.read().values().filter(|r| r.active).count()
    }

    /// Returns true if `channels` has an active record.
    #[must_use]
    pub fn is_active(&self, channels: &ChannelSet) -> bool {
        self.records
            .read()
            .get(&channels.key())
            .is_some_and(|r| r.active)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::events::EventKind;
    use crate::transport::LoopbackTransport;

    async fn setup() -> (Arc<LoopbackTransport>, Arc<EventBus>, Arc<SubscriptionRegistry>) {
        let transport = Arc::new(LoopbackTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        let events = Arc::new(EventBus::new());
        let registry = SubscriptionRegistry::new(transport.clone(), Arc::clone(&events));
        (transport, events, registry)
    }

    fn set(c: &str) -> ChannelSet {
        ChannelSet::single(c).unwrap()
    }

    #[tokio::test]
    async fn test_same_channel_set_is_idempotent() {
        let (transport, _events, registry) = setup().await;
        let d1 = registry.subscribe(&set("a"), |_| Ok(())).unwrap();
        let d2 = registry.subscribe(&set("a"), |_| Ok(())).unwrap();

        assert!(d1.same_registration(&d2));
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.matching(["a"])[0].callbacks.len(), 2);

        assert!(registry.unsubscribe(&d2));
        assert!(!d1.dispose());
        assert_eq!(transport.unsubscribe_calls(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_reported() {
        let (transport, events, registry) = setup().await;
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        events.on(EventKind::Error, move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        transport.fail_subscribe_for(&set("bad"));
        let err = registry.subscribe(&set("bad"), |_| Ok(())).unwrap_err();
        assert!(matches!(err, SyncError::Subscription { .. }));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_still_removes_record() {
        let (transport, _events, registry) = setup().await;
        let d = registry.subscribe(&set("a"), |_| Ok(())).unwrap();
        transport.set_unsubscribe_failing(true);
        assert!(d.dispose());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_all_is_best_effort() {
        let (transport, _events, registry) = setup().await;
        let d1 = registry.subscribe(&set("a"), |_| Ok(())).unwrap();
        let d2 = registry.subscribe(&set("b"), |_| Ok(())).unwrap();
        transport.set_unsubscribe_failing(true);

        assert_eq!(registry.teardown_all(), 2);
        assert_eq!(transport.unsubscribe_calls(), 2);
        assert!(registry.is_empty());
        assert!(d1.is_disposed());
        assert!(!d2.dispose());
        assert_eq!(transport.unsubscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_restore_all_partial_failure() {
        let (transport, _events, registry) = setup().await;
        registry.subscribe(&set("a"), |_| Ok(())).unwrap();
        registry.subscribe(&set("b"), |_| Ok(())).unwrap();

        transport.close().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.fail_subscribe_for(&set("b"));

        let report = registry.restore_all();
        assert_eq!(report.restored, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
        assert!(registry.is_active(&set("a")));
        assert!(!registry.is_active(&set("b")));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(transport.registration_count(), 1);
        assert!(registry.matching(["b"]).is_empty());
    }

    #[tokio::test]
    async fn test_inactive_record_resubscribes_on_demand() {
        let (transport, _events, registry) = setup().await;
        let d = registry.subscribe(&set("b"), |_| Ok(())).unwrap();
        transport.fail_subscribe_for(&set("b"));
        registry.restore_all();
        assert!(!registry.is_active(&set("b")));

        transport.clear_failures();
        let again = registry.subscribe(&set("b"), |_| Ok(())).unwrap();
        assert!(again.same_registration(&d));
        assert!(registry.is_active(&set("b")));
        assert_eq!(registry.matching(["b"])[0].callbacks.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_disposer_does_not_remove_new_record() {
        let (_transport, _events, registry) = setup().await;
        let old = registry.subscribe(&set("a"), |_| Ok(())).unwrap();
        registry.teardown_all();
        let _new = registry.subscribe(&set("a"), |_| Ok(())).unwrap();

        assert!(!old.dispose());
        assert_eq!(registry.len(), 1);
    }
}
