//! Inbound message routing.
//!
//! Every raw message from the transport passes through [`EventRouter::dispatch`]
//! on the single dispatch task, so callbacks observe messages in delivery order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::activity::{self, ActivityCategory, ActivityEntry, ActivityLogger};
use crate::channel::StandardChannel;
use crate::config::ChannelLayout;
use crate::entity::EntityId;
use crate::error::{CallbackError, SyncError};
use crate::events::{ClientEvent, EventBus};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::InboundEvent;
use crate::registry::{CallbackResult, SubscriptionRegistry};
use crate::state::EntityBinding;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message could not be parsed and was skipped.
    Malformed,
    /// The payload names another entity.
    Filtered,
    /// No active subscription covers the message's channels.
    Unmatched,
    /// Callbacks were invoked.
    Delivered {
        /// Callbacks invoked.
        callbacks: usize,
        /// Callbacks that failed or panicked.
        failures: usize,
    },
}

/// Runs `f`, converting an error or a panic into one published
/// [`SyncError::Callback`]. Returns true on success.
pub(crate) fn invoke_isolated(
    events: &EventBus,
    name: &str,
    f: impl FnOnce() -> CallbackResult,
) -> bool {
    let source = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => e,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "callback panicked".to_string());
            CallbackError::new(format!("panic: {message}"))
        }
    };
    tracing::error!(callback = name, error = %source, "callback failed");
    events.emit(ClientEvent::Error(SyncError::Callback {
        callback: name.to_string(),
        source,
    }));
    false
}

/// Routes inbound messages to subscription callbacks.
pub struct EventRouter {
    registry: Arc<SubscriptionRegistry>,
    events: Arc<EventBus>,
    binding: EntityBinding,
    heartbeat: Arc<HeartbeatMonitor>,
    activity: Arc<dyn ActivityLogger>,
    layout: ChannelLayout,
    platform: String,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("binding", &self.binding)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Creates a router over the shared client components.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        events: Arc<EventBus>,
        binding: EntityBinding,
        heartbeat: Arc<HeartbeatMonitor>,
        activity: Arc<dyn ActivityLogger>,
        layout: ChannelLayout,
        platform: String,
    ) -> Self {
        Self {
            registry,
            events,
            binding,
            heartbeat,
            activity,
            layout,
            platform,
        }
    }

    /// Routes one raw message.
    ///
    /// Any parseable message counts as link activity, including one dropped
    /// by the ownership filter. A failing callback never stops delivery to
    /// the others.
    pub fn dispatch(&self, raw: &str) -> DispatchOutcome {
        let event = match InboundEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed message");
                return DispatchOutcome::Malformed;
            }
        };
        self.heartbeat.record_activity();

        if let Some(owner) = event.owner() {
            if !self.binding.matches(owner) {
                tracing::debug!(owner, "message for another entity dropped");
                return DispatchOutcome::Filtered;
            }
        }

        let channels: Vec<&str> = event.channel_ids().collect();
        let matched = self.registry.matching(channels.iter().copied());
        if matched.is_empty() {
            tracing::trace!(?channels, "no subscription for message");
            return DispatchOutcome::Unmatched;
        }

        let mut callbacks = 0;
        let mut failures = 0;
        for subscription in &matched {
            for slot in &subscription.callbacks {
                callbacks += 1;
                if !invoke_isolated(&self.events, &slot.name, || (slot.callback)(&event)) {
                    failures += 1;
                }
            }
        }

        self.log_activity(&channels, &event.payload);
        self.events.emit(ClientEvent::Message {
            channels: channels.iter().map(|c| (*c).to_string()).collect(),
        });
        DispatchOutcome::Delivered { callbacks, failures }
    }

    fn log_activity(&self, channels: &[&str], payload: &Value) {
        let Some(entity) = self.binding.get() else {
            return;
        };
        for channel in channels {
            let Some(standard) = self.layout.classify(channel, &entity) else {
                continue;
            };
            if let Some(entry) = self.describe(standard, &entity, payload) {
                activity::record(self.activity.as_ref(), entry);
            }
        }
    }

    fn describe(
        &self,
        channel: StandardChannel,
        entity: &EntityId,
        payload: &Value,
    ) -> Option<ActivityEntry> {
        let (category, description, metadata) = match channel {
            StandardChannel::Transaction => {
                let kind = field(payload, "type").unwrap_or_else(|| "transaction".to_string());
                let description = format!(
                    "{}: {} {} ({})",
                    kind.to_uppercase(),
                    field(payload, "amount").unwrap_or_else(|| "?".to_string()),
                    field(payload, "symbol").unwrap_or_default(),
                    field(payload, "status").unwrap_or_else(|| "unknown".to_string()),
                );
                (
                    ActivityCategory::Transaction,
                    description,
                    pick(payload, &["type", "amount", "symbol", "status"]),
                )
            }
            StandardChannel::Portfolio => {
                let total = field(payload, "totalValue").unwrap_or_else(|| "?".to_string());
                (
                    ActivityCategory::PortfolioUpdate,
                    format!("Portfolio value: {total}"),
                    pick(payload, &["totalValue"]),
                )
            }
            StandardChannel::UserProfile => {
                let changed: Vec<Value> = payload
                    .as_object()
                    .map(|obj| {
                        obj.keys()
                            .filter(|k| !k.starts_with('$'))
                            .map(|k| Value::String(k.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut metadata = Map::new();
                metadata.insert("changed_fields".to_string(), Value::Array(changed));
                (ActivityCategory::SettingChange, "Profile updated".to_string(), metadata)
            }
            // Activity documents are themselves log output.
            StandardChannel::Activity => return None,
        };

        Some(ActivityEntry {
            entity_id: entity.clone(),
            category,
            description,
            metadata,
            timestamp: Utc::now(),
            platform: self.platform.clone(),
        })
    }
}

/// Renders a payload field for a description.
fn field(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn pick(payload: &Value, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|k| payload.get(*k).map(|v| ((*k).to_string(), v.clone())))
        .collect()
}
