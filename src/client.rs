//! Connection manager: the public face of the real-time client.
//!
//! [`ConnectionManager`] owns the connection state machine and the entity
//! binding, wires the registry, router, heartbeat and reconnect scheduler
//! together, and exposes the application-facing operations.
//!
//! Construct one per process and share clones of it; clones are cheap handles
//! onto the same client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::activity::{self, ActivityCategory, ActivityEntry, ActivityLogger};
use crate::channel::{ChannelSet, StandardChannel};
use crate::config::ClientConfig;
use crate::entity::EntityId;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::events::{
    ClientEvent, DisconnectReason, EventBus, EventKind, ListenerId, ReconnectReason,
};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::InboundEvent;
use crate::reconnect::{ReconnectScheduler, ReconnectTarget, ReopenOutcome};
use crate::registry::{CallbackResult, Disposer, MessageCallback, SubscriptionRegistry};
use crate::router::{self, EventRouter};
use crate::state::{ConnectionState, EntityBinding, StateCell};
use crate::transport::{RealtimeTransport, TransportSignal};

/// Callback receiving the payload of an entity update.
pub type EntityCallback = Arc<dyn Fn(&Value) -> CallbackResult + Send + Sync>;

/// Named callbacks for [`ConnectionManager::subscribe_to_entity`].
///
/// Every callback is optional.
///
/// # Example
///
/// ```rust
/// use realtime_sync::EntityCallbacks;
///
/// let callbacks = EntityCallbacks::new()
///     .on_transaction_update(|payload| {
///         println!("transaction: {payload}");
///         Ok(())
///     })
///     .on_error(|err| eprintln!("sync error: {err}"));
/// assert_eq!(callbacks.data_callback_count(), 1);
/// ```
#[derive(Clone, Default)]
pub struct EntityCallbacks {
    portfolio: Option<EntityCallback>,
    transaction: Option<EntityCallback>,
    activity: Option<EntityCallback>,
    user: Option<EntityCallback>,
    on_connect: Option<Arc<dyn Fn(&EntityId) + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn(DisconnectReason) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&SyncError) + Send + Sync>>,
}

impl fmt::Debug for EntityCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCallbacks")
            .field("on_portfolio_update", &self.portfolio.is_some())
            .field("on_transaction_update", &self.transaction.is_some())
            .field("on_activity_update", &self.activity.is_some())
            .field("on_user_update", &self.user.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl EntityCallbacks {
    /// Creates an empty set of callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Portfolio document updates.
    #[must_use]
    pub fn on_portfolio_update(
        mut self,
        f: impl Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    ) -> Self {
        self.portfolio = Some(Arc::new(f));
        self
    }

    /// Transaction document updates.
    #[must_use]
    pub fn on_transaction_update(
        mut self,
        f: impl Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    ) -> Self {
        self.transaction = Some(Arc::new(f));
        self
    }

    /// Activity feed updates.
    #[must_use]
    pub fn on_activity_update(
        mut self,
        f: impl Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    ) -> Self {
        self.activity = Some(Arc::new(f));
        self
    }

    /// User profile updates.
    #[must_use]
    pub fn on_user_update(
        mut self,
        f: impl Fn(&Value) -> CallbackResult + Send + Sync + 'static,
    ) -> Self {
        self.user = Some(Arc::new(f));
        self
    }

    /// The client connected (or reconnected).
    #[must_use]
    pub fn on_connect(mut self, f: impl Fn(&EntityId) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// The client became disconnected.
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Any error published by the client.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Number of data callbacks set.
    #[must_use]
    pub fn data_callback_count(&self) -> usize {
        self.data_callbacks().len()
    }

    fn data_callbacks(&self) -> Vec<(StandardChannel, EntityCallback)> {
        [
            (StandardChannel::Portfolio, &self.portfolio),
            (StandardChannel::Transaction, &self.transaction),
            (StandardChannel::Activity, &self.activity),
            (StandardChannel::UserProfile, &self.user),
        ]
        .into_iter()
        .filter_map(|(channel, cb)| cb.clone().map(|cb| (channel, cb)))
        .collect()
    }
}

#[derive(Clone)]
struct EntityListener {
    id: ListenerId,
    entity: EntityId,
    callback: EntityCallback,
}

struct TeardownState {
    done: AtomicBool,
    client: Weak<Inner>,
    listeners: Vec<(StandardChannel, ListenerId)>,
    status: Vec<ListenerId>,
}

/// Reverses one [`ConnectionManager::subscribe_to_entity`] call.
///
/// Clones share state; tearing down twice is a no-op.
#[derive(Clone)]
#[must_use = "dropping the teardown handle leaves the callbacks attached"]
pub struct EntityTeardown {
    state: Arc<TeardownState>,
}

impl fmt::Debug for EntityTeardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityTeardown")
            .field("torn_down", &self.is_torn_down())
            .field("callbacks", &self.state.listeners.len())
            .finish()
    }
}

impl EntityTeardown {
    /// Detaches every callback the originating call attached.
    ///
    /// Returns true if this call performed the teardown.
    pub fn teardown(&self) -> bool {
        if self.state.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(client) = self.state.client.upgrade() {
            {
                let mut table = client.entity_listeners.write();
                for (channel, id) in &self.state.listeners {
                    if let Some(list) = table.get_mut(channel) {
                        list.retain(|l| l.id != *id);
                    }
                }
            }
            for id in &self.state.status {
                client.events.off(*id);
            }
            tracing::debug!(callbacks = self.state.listeners.len(), "entity callbacks detached");
        }
        true
    }

    /// Returns true once torn down.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }
}

struct Inner {
    this: Weak<Inner>,
    config: ClientConfig,
    transport: Arc<dyn RealtimeTransport>,
    events: Arc<EventBus>,
    state: StateCell,
    binding: EntityBinding,
    registry: Arc<SubscriptionRegistry>,
    router: EventRouter,
    heartbeat: Arc<HeartbeatMonitor>,
    scheduler: Arc<ReconnectScheduler>,
    activity: Arc<dyn ActivityLogger>,
    entity_listeners: RwLock<HashMap<StandardChannel, Vec<EntityListener>>>,
    standard: Mutex<Vec<Disposer>>,
    paused: Mutex<Option<EntityId>>,
    epoch: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// The real-time synchronization client.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use realtime_sync::{
///     ClientConfig, ConnectionManager, EntityCallbacks, LoopbackTransport, TracingActivityLogger,
/// };
///
/// # async fn run() -> realtime_sync::SyncResult<()> {
/// let client = ConnectionManager::new(
///     ClientConfig::default(),
///     Arc::new(LoopbackTransport::new()),
///     Arc::new(TracingActivityLogger),
/// )?;
///
/// client.connect("user-42").await?;
/// let teardown = client.subscribe_to_entity(
///     "user-42",
///     EntityCallbacks::new().on_portfolio_update(|p| {
///         println!("portfolio: {p}");
///         Ok(())
///     }),
/// )?;
///
/// teardown.teardown();
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("entity", &self.bound_entity())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a disconnected client.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if `config` is invalid.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn RealtimeTransport>,
        activity: Arc<dyn ActivityLogger>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::new());
        let state = StateCell::default();
        let binding = EntityBinding::default();
        let registry = SubscriptionRegistry::new(Arc::clone(&transport), Arc::clone(&events));
        let heartbeat = HeartbeatMonitor::new(config.heartbeat.clone(), state.clone());
        let scheduler = ReconnectScheduler::new(config.reconnect.clone());
        let router = EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            binding.clone(),
            Arc::clone(&heartbeat),
            Arc::clone(&activity),
            config.channels.clone(),
            config.platform.clone(),
        );

        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            config,
            transport,
            events,
            state,
            binding,
            registry,
            router,
            heartbeat,
            scheduler,
            activity,
            entity_listeners: RwLock::new(HashMap::new()),
            standard: Mutex::new(Vec::new()),
            paused: Mutex::new(None),
            epoch: AtomicU64::new(0),
            dispatch: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        });
        Ok(Self { inner })
    }

    /// Opens the transport, binds `entity_id` and establishes the standard
    /// subscriptions.
    ///
    /// Connecting to the already bound entity is a no-op; connecting to a
    /// different one tears the current session down first. A transport open
    /// failure is reported and not retried.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty id and
    /// [`SyncError::TransportOpen`] if the transport cannot be opened.
    pub async fn connect(&self, entity_id: impl AsRef<str>) -> SyncResult<()> {
        let entity = self.inner.validated(entity_id.as_ref())?;
        self.inner.paused.lock().take();
        self.inner.connect(entity).await
    }

    /// Tears everything down and returns to `Disconnected`.
    ///
    /// Safe to call in any state and more than once.
    pub async fn disconnect(&self) {
        self.inner.paused.lock().take();
        self.inner.stop_timers();
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.shutdown(DisconnectReason::Requested, true).await;
    }

    /// Disconnects but remembers the bound entity and keeps application
    /// subscriptions for [`ConnectionManager::resume`].
    pub async fn pause(&self) {
        self.inner.stop_timers();
        let _guard = self.inner.lifecycle.lock().await;
        if let Some(entity) = self.inner.binding.get() {
            *self.inner.paused.lock() = Some(entity);
        }
        self.inner.shutdown(DisconnectReason::Paused, false).await;
    }

    /// Reconnects to the entity remembered by [`ConnectionManager::pause`].
    ///
    /// Returns false if there was nothing to resume.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::connect`].
    pub async fn resume(&self) -> SyncResult<bool> {
        let Some(entity) = self.inner.paused.lock().take() else {
            return Ok(false);
        };
        self.inner.connect(entity).await.map(|()| true)
    }

    /// Subscribes `callback` to an arbitrary channel set.
    ///
    /// Subscribing again to the same set attaches the callback to the
    /// existing registration and returns the same [`Disposer`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Subscription`] if the transport rejects it.
    pub fn subscribe(
        &self,
        channels: &ChannelSet,
        callback: impl Fn(&InboundEvent) -> CallbackResult + Send + Sync + 'static,
    ) -> SyncResult<Disposer> {
        self.inner.registry.subscribe(channels, callback)
    }

    /// Reverses a [`ConnectionManager::subscribe`] registration.
    pub fn unsubscribe(&self, disposer: &Disposer) -> bool {
        self.inner.registry.unsubscribe(disposer)
    }

    /// Attaches named data callbacks for `entity_id` and connection-status
    /// callbacks.
    ///
    /// Data callbacks only receive updates owned by `entity_id` (or carrying
    /// no owner). They are delivered over the standard subscriptions, so
    /// they fire while the client is connected.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty id.
    pub fn subscribe_to_entity(
        &self,
        entity_id: impl AsRef<str>,
        callbacks: EntityCallbacks,
    ) -> SyncResult<EntityTeardown> {
        let entity = self.inner.validated(entity_id.as_ref())?;
        let inner = &self.inner;

        let mut listeners = Vec::new();
        {
            let mut table = inner.entity_listeners.write();
            for (channel, callback) in callbacks.data_callbacks() {
                let id = ListenerId::new();
                table.entry(channel).or_default().push(EntityListener {
                    id,
                    entity: entity.clone(),
                    callback,
                });
                listeners.push((channel, id));
            }
        }

        let mut status = Vec::new();
        if let Some(f) = callbacks.on_connect {
            status.push(inner.events.on(EventKind::Connected, move |event| {
                if let ClientEvent::Connected { entity_id } = event {
                    f(entity_id);
                }
            }));
        }
        if let Some(f) = callbacks.on_disconnect {
            status.push(inner.events.on(EventKind::Disconnected, move |event| {
                if let ClientEvent::Disconnected { reason } = event {
                    f(*reason);
                }
            }));
        }
        if let Some(f) = callbacks.on_error {
            status.push(inner.events.on(EventKind::Error, move |event| {
                if let ClientEvent::Error(err) = event {
                    f(err);
                }
            }));
        }

        tracing::info!(
            entity_id = %entity,
            callbacks = listeners.len(),
            "entity callbacks attached"
        );
        inner.events.emit(ClientEvent::EntitySubscribed {
            entity_id: entity,
            subscription_count: listeners.len(),
        });

        Ok(EntityTeardown {
            state: Arc::new(TeardownState {
                done: AtomicBool::new(false),
                client: Arc::downgrade(inner),
                listeners,
                status,
            }),
        })
    }

    /// Registers a listener for one kind of client event.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.on(kind, listener)
    }

    /// Registers a listener for every client event.
    pub fn on_any(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.events.on_any(listener)
    }

    /// Detaches a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Async stream of every client event emitted from now on.
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<ClientEvent> {
        self.inner.events.stream()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Returns true while `Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    /// Number of channel-set registrations, standard ones included.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Entity the standard subscriptions are bound to.
    #[must_use]
    pub fn bound_entity(&self) -> Option<EntityId> {
        self.inner.binding.get()
    }

    /// Reconnect attempts since the last successful connection.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.scheduler.attempts()
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    fn validated(&self, raw: &str) -> SyncResult<EntityId> {
        EntityId::new(raw).map_err(|e| {
            let err = SyncError::from(e);
            self.events.emit(ClientEvent::Error(err.clone()));
            err
        })
    }

    fn target(&self) -> Option<Arc<dyn ReconnectTarget>> {
        self.this.upgrade().map(|inner| inner as Arc<dyn ReconnectTarget>)
    }

    async fn connect(&self, entity: EntityId) -> SyncResult<()> {
        if !self.config.realtime_enabled {
            tracing::info!(entity_id = %entity, "realtime disabled, connect skipped");
            return Ok(());
        }

        let _guard = self.lifecycle.lock().await;
        if self.state.is_connected() && self.binding.get().as_ref() == Some(&entity) {
            tracing::debug!(entity_id = %entity, "already connected");
            return Ok(());
        }
        if self.state.get() != ConnectionState::Disconnected {
            // Application records survive a rebind and are restored below.
            self.stop_timers();
            self.shutdown(DisconnectReason::Requested, false).await;
        }

        tracing::info!(entity_id = %entity, "connecting");
        self.state.set(ConnectionState::Connecting);
        if let Err(e) = self.open_transport().await {
            self.state.set(ConnectionState::Disconnected);
            let err = SyncError::TransportOpen(e);
            tracing::error!(entity_id = %entity, error = %err, "connect failed");
            self.events.emit(ClientEvent::Error(err.clone()));
            self.events.emit(ClientEvent::Disconnected {
                reason: DisconnectReason::ConnectFailed,
            });
            return Err(err);
        }

        self.binding.bind(entity.clone());
        self.registry.restore_all();
        self.establish_standard(&entity);
        self.start_heartbeat();
        self.scheduler.reset();
        self.state.set(ConnectionState::Connected);

        activity::record(
            self.activity.as_ref(),
            ActivityEntry {
                entity_id: entity.clone(),
                category: ActivityCategory::Login,
                description: "Realtime session started".to_string(),
                metadata: Map::new(),
                timestamp: Utc::now(),
                platform: self.config.platform.clone(),
            },
        );
        tracing::info!(entity_id = %entity, subscriptions = self.registry.len(), "connected");
        self.events.emit(ClientEvent::Connected { entity_id: entity });
        Ok(())
    }

    /// Opens the transport with a fresh signal queue and its dispatch task.
    async fn open_transport(&self) -> Result<(), TransportError> {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.open(tx).await?;

        let task = tokio::spawn(run_dispatch(self.this.clone(), epoch, rx));
        if let Some(previous) = self.dispatch.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Registers the four standard channel sets. A rejected set is reported
    /// by the registry and skipped.
    fn establish_standard(&self, entity: &EntityId) {
        let mut standard = self.standard.lock();
        for channel in StandardChannel::ALL {
            let set = match self.config.channels.channel_set(channel, entity) {
                Ok(set) => set,
                Err(e) => {
                    tracing::error!(%channel, error = %e, "invalid standard channel");
                    continue;
                }
            };
            match self
                .registry
                .subscribe_named(&set, channel.callback_name(), self.forwarder(channel))
            {
                Ok(disposer) => standard.push(disposer),
                Err(e) => tracing::warn!(%channel, error = %e, "standard subscription failed"),
            }
        }
    }

    fn forwarder(&self, channel: StandardChannel) -> MessageCallback {
        let client = self.this.clone();
        Arc::new(move |event: &InboundEvent| {
            if let Some(client) = client.upgrade() {
                client.forward(channel, event);
            }
            Ok(())
        })
    }

    /// Fans a standard-channel message out to entity callbacks.
    fn forward(&self, channel: StandardChannel, event: &InboundEvent) {
        let targets: Vec<EntityListener> = self
            .entity_listeners
            .read()
            .get(&channel)
            .cloned()
            .unwrap_or_default();
        let owner = event.owner();
        for listener in targets {
            if owner.is_some_and(|o| o != listener.entity.as_str()) {
                continue;
            }
            router::invoke_isolated(&self.events, channel.callback_name(), || {
                (listener.callback)(&event.payload)
            });
        }
    }

    fn start_heartbeat(&self) {
        let client = self.this.clone();
        self.heartbeat.start(move |idle| {
            if let Some(client) = client.upgrade() {
                tracing::debug!(
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    "stale connection detected"
                );
                client.trigger_reconnect(ReconnectReason::Stale);
            }
        });
    }

    fn stop_timers(&self) {
        self.heartbeat.stop();
        self.scheduler.cancel();
    }

    fn trigger_reconnect(&self, reason: ReconnectReason) {
        if !self.state.is_connected() {
            tracing::debug!(state = %self.state.get(), ?reason, "reconnect not applicable");
            return;
        }
        if let Some(target) = self.target() {
            self.scheduler.trigger(target, reason);
        }
    }

    fn on_transport_lost(&self, message: String) {
        tracing::warn!(error = %message, "transport lost");
        self.registry.detach_transport();
        self.trigger_reconnect(ReconnectReason::TransportLost { message });
    }

    /// Common teardown for disconnect and pause. Callers hold the lifecycle
    /// lock and have already stopped the timers.
    async fn shutdown(&self, reason: DisconnectReason, drop_records: bool) {
        let previous = self.state.get();
        let standard: Vec<Disposer> = self.standard.lock().drain(..).collect();
        if previous == ConnectionState::Disconnected
            && standard.is_empty()
            && self.registry.is_empty()
        {
            tracing::debug!("already disconnected");
            return;
        }

        for disposer in &standard {
            disposer.dispose();
        }
        if drop_records {
            self.registry.teardown_all();
        } else {
            self.registry.detach_transport();
        }

        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "transport close failed");
        }

        let entity = self.binding.clear();
        self.state.set(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            tracing::info!(
                entity_id = ?entity.as_ref().map(EntityId::as_str),
                %reason,
                "disconnected"
            );
            self.events.emit(ClientEvent::Disconnected { reason });
        }
    }
}

#[async_trait]
impl ReconnectTarget for Inner {
    fn reconnecting(&self, attempt: u32, delay: Duration, reason: &ReconnectReason) {
        if !self.state.transition(ConnectionState::Connected, ConnectionState::Reconnecting) {
            tracing::debug!(state = %self.state.get(), attempt, "state already left connected");
        }
        self.heartbeat.rearm();
        self.events.emit(ClientEvent::Reconnecting {
            attempt,
            delay,
            reason: reason.clone(),
        });
    }

    async fn reopen(&self) -> ReopenOutcome {
        let _guard = self.lifecycle.lock().await;
        if self.state.get() != ConnectionState::Reconnecting {
            return ReopenOutcome::Abandoned;
        }
        let Some(entity) = self.binding.get() else {
            return ReopenOutcome::Abandoned;
        };

        self.heartbeat.stop();
        self.registry.detach_transport();
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "closing stale transport failed");
        }
        if let Err(e) = self.open_transport().await {
            return ReopenOutcome::Failed(SyncError::TransportOpen(e));
        }

        let report = self.registry.restore_all();
        self.start_heartbeat();
        self.state.set(ConnectionState::Connected);
        tracing::info!(
            entity_id = %entity,
            restored = report.restored,
            failed = report.failed.len(),
            "connection restored"
        );
        self.events.emit(ClientEvent::Connected { entity_id: entity });
        ReopenOutcome::Restored
    }

    fn exhausted(&self, attempts: u32) {
        self.heartbeat.stop();
        self.registry.detach_transport();
        for disposer in self.standard.lock().drain(..) {
            disposer.dispose();
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.dispatch.lock().take() {
            task.abort();
        }
        self.binding.clear();
        self.state.set(ConnectionState::Disconnected);
        self.events.emit(ClientEvent::Error(SyncError::ReconnectExhausted { attempts }));
        self.events.emit(ClientEvent::Disconnected {
            reason: DisconnectReason::ReconnectExhausted,
        });
    }
}

/// Drains one connection's signal queue in order.
async fn run_dispatch(
    client: Weak<Inner>,
    epoch: u64,
    mut rx: mpsc::UnboundedReceiver<TransportSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let Some(client) = client.upgrade() else {
            break;
        };
        if client.epoch.load(Ordering::Acquire) != epoch {
            break;
        }
        match signal {
            TransportSignal::Message(raw) => {
                client.router.dispatch(&raw);
            }
            TransportSignal::Error { message } => client.on_transport_lost(message),
            TransportSignal::Closed { reason } => {
                client.on_transport_lost(reason.unwrap_or_else(|| "connection closed".to_string()));
            }
        }
    }
    tracing::trace!(epoch, "dispatch task finished");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;
    use crate::activity::MemoryActivityLogger;
    use crate::transport::LoopbackTransport;

    fn client() -> (ConnectionManager, Arc<LoopbackTransport>, Arc<MemoryActivityLogger>) {
        let transport = Arc::new(LoopbackTransport::new());
        let activity = Arc::new(MemoryActivityLogger::new());
        let client =
            ConnectionManager::new(ClientConfig::default(), transport.clone(), activity.clone())
                .unwrap();
        (client, transport, activity)
    }

    fn path(client: &ConnectionManager, channel: StandardChannel, entity: &str) -> String {
        client
            .config()
            .channels
            .channel_path(channel, &EntityId::new(entity).unwrap())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_establishes_standard_subscriptions() {
        let (client, transport, activity) = client();
        client.connect("u1").await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.bound_entity().unwrap().as_str(), "u1");
        assert_eq!(client.subscription_count(), 4);
        assert_eq!(transport.registration_count(), 4);
        assert_eq!(activity.entries()[0].category, ActivityCategory::Login);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_entity() {
        let (client, transport, _) = client();
        let err = client.connect("  ").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(transport.open_calls(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let (client, transport, _) = client();
        let disconnected = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&disconnected);
        client.on(EventKind::Disconnected, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        transport.fail_next_opens(1);

        let err = client.connect("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::TransportOpen(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(transport.open_calls(), 1);
        assert!(client.bound_entity().is_none());
    }

    #[tokio::test]
    async fn test_realtime_disabled_connect_is_noop() {
        let transport = Arc::new(LoopbackTransport::new());
        let config = ClientConfig::default().with_realtime_enabled(false);
        let client =
            ConnectionManager::new(config, transport.clone(), Arc::new(MemoryActivityLogger::new()))
                .unwrap();

        client.connect("u1").await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_entity_callbacks_filter_by_entity() {
        let (client, transport, _) = client();
        client.connect("u1").await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let teardown = client
            .subscribe_to_entity(
                "u1",
                EntityCallbacks::new().on_portfolio_update(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let portfolios = path(&client, StandardChannel::Portfolio, "u1");
        assert!(transport.publish(&portfolios, json!({"ownerId": "u1", "totalValue": 10})));
        assert!(transport.publish(&portfolios, json!({"ownerId": "u2", "totalValue": 20})));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(teardown.teardown());
        assert!(!teardown.teardown());
        transport.publish(&portfolios, json!({"ownerId": "u1"}));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_detaches_status_callbacks() {
        let (client, _transport, _) = client();
        let connects = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        let teardown = client
            .subscribe_to_entity(
                "u1",
                EntityCallbacks::new().on_connect(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        client.connect("u1").await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        teardown.teardown();
        client.disconnect().await;
        client.connect("u1").await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_application_subscriptions() {
        let (client, transport, _) = client();
        client.connect("u1").await.unwrap();
        let custom = ChannelSet::single("custom").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _disposer = client
            .subscribe(&custom, move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        client.pause().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.subscription_count(), 1);
        assert!(!transport.is_open());

        assert!(client.resume().await.unwrap());
        assert!(!client.resume().await.unwrap());
        assert_eq!(client.bound_entity().unwrap().as_str(), "u1");
        assert_eq!(client.subscription_count(), 5);

        assert!(transport.publish("custom", json!({})));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_to_other_entity_rebinds() {
        let (client, transport, _) = client();
        client.connect("u1").await.unwrap();
        client.connect("u1").await.unwrap();
        assert_eq!(transport.open_calls(), 1);

        client.connect("u2").await.unwrap();
        assert_eq!(client.bound_entity().unwrap().as_str(), "u2");
        assert_eq!(client.subscription_count(), 4);
        assert_eq!(transport.registration_count(), 4);
    }

    #[tokio::test]
    async fn test_rebind_keeps_application_subscriptions() {
        let (client, transport, _) = client();
        client.connect("u1").await.unwrap();
        let feed = ChannelSet::single("feed").unwrap();
        let disposer = client.subscribe(&feed, |_| Ok(())).unwrap();

        client.connect("u2").await.unwrap();
        assert!(!disposer.is_disposed());
        assert_eq!(client.subscription_count(), 5);
        assert!(transport.publish("feed", json!({})));
    }
}
