//! Client configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. The heartbeat and reconnect timings are tunables rather than
//! protocol facts: the stale threshold must be longer than the longest quiet
//! period the backend can legitimately produce, otherwise a live but idle
//! connection is recycled.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelSet, StandardChannel};
use crate::entity::EntityId;
use crate::error::ValidationError;

/// Staleness detection timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the monitor compares the clock against the last activity.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Quiet period after which a `Connected` link is considered stale.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_stale_threshold_ms() -> u64 {
    30_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
        }
    }
}

impl HeartbeatConfig {
    /// Check interval as a `Duration`.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Stale threshold as a `Duration`.
    #[must_use]
    pub const fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }
}

/// Bounded exponential backoff policy.
///
/// Attempt `n` (1-based) waits `base_delay_ms * multiplier^(n-1)`, optionally
/// capped at `max_delay_ms`. Attempt `max_attempts + 1` is never scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Growth factor between consecutive attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempts allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Optional ceiling for a single delay.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            max_delay_ms: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a 1-based attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let mut ms = if raw.is_finite() && raw < u64::MAX as f64 {
            raw.round() as u64
        } else {
            u64::MAX
        };
        if let Some(cap) = self.max_delay_ms {
            ms = ms.min(cap);
        }
        Duration::from_millis(ms)
    }
}

/// Maps the standard categories onto backend channel paths.
///
/// Collection channels are `databases.{db}.collections.{collection}.documents`;
/// the user-profile channel additionally names the entity's own document.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    #[serde(default = "default_database_id")]
    pub database_id: String,
    #[serde(default = "default_portfolio_collection")]
    pub portfolio_collection: String,
    #[serde(default = "default_transaction_collection")]
    pub transaction_collection: String,
    #[serde(default = "default_activity_collection")]
    pub activity_collection: String,
    #[serde(default = "default_user_collection")]
    pub user_collection: String,
}

fn default_database_id() -> String {
    "main".to_string()
}

fn default_portfolio_collection() -> String {
    "portfolios".to_string()
}

fn default_transaction_collection() -> String {
    "transactions".to_string()
}

fn default_activity_collection() -> String {
    "activity".to_string()
}

fn default_user_collection() -> String {
    "users".to_string()
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self {
            database_id: default_database_id(),
            portfolio_collection: default_portfolio_collection(),
            transaction_collection: default_transaction_collection(),
            activity_collection: default_activity_collection(),
            user_collection: default_user_collection(),
        }
    }
}

impl ChannelLayout {
    fn collection(&self, channel: StandardChannel) -> &str {
        match channel {
            StandardChannel::Portfolio => &self.portfolio_collection,
            StandardChannel::Transaction => &self.transaction_collection,
            StandardChannel::Activity => &self.activity_collection,
            StandardChannel::UserProfile => &self.user_collection,
        }
    }

    /// Channel path for a standard category bound to `entity`.
    #[must_use]
    pub fn channel_path(&self, channel: StandardChannel, entity: &EntityId) -> String {
        let base = format!(
            "databases.{}.collections.{}.documents",
            self.database_id,
            self.collection(channel)
        );
        match channel {
            StandardChannel::UserProfile => format!("{base}.{entity}"),
            _ => base,
        }
    }

    /// Channel set for a standard category bound to `entity`.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the layout produces a blank channel.
    pub fn channel_set(
        &self,
        channel: StandardChannel,
        entity: &EntityId,
    ) -> Result<ChannelSet, ValidationError> {
        ChannelSet::single(self.channel_path(channel, entity))
    }

    /// Classifies an inbound channel path as one of the standard categories.
    #[must_use]
    pub fn classify(&self, path: &str, entity: &EntityId) -> Option<StandardChannel> {
        StandardChannel::ALL
            .into_iter()
            .find(|c| self.channel_path(*c, entity) == path)
    }
}

/// Top-level client configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// When false, `connect` is a no-op and the client stays `Disconnected`.
    #[serde(default = "default_realtime_enabled")]
    pub realtime_enabled: bool,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub channels: ChannelLayout,

    /// Platform tag stamped on activity log entries.
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_realtime_enabled() -> bool {
    true
}

fn default_platform() -> String {
    "server".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            realtime_enabled: default_realtime_enabled(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            channels: ChannelLayout::default(),
            platform: default_platform(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidConfig`] for malformed JSON or
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            field: "<document>".to_string(),
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |field: &str, reason: &str| ValidationError::InvalidConfig {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.heartbeat.check_interval_ms == 0 {
            return Err(invalid("heartbeat.check_interval_ms", "must be greater than zero"));
        }
        if self.heartbeat.stale_threshold_ms < self.heartbeat.check_interval_ms {
            return Err(invalid(
                "heartbeat.stale_threshold_ms",
                "must be at least heartbeat.check_interval_ms",
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(invalid("reconnect.multiplier", "must be a finite value >= 1.0"));
        }
        if self.channels.database_id.trim().is_empty() {
            return Err(invalid("channels.database_id", "must not be empty"));
        }
        Ok(())
    }

    /// Set whether `connect` opens the transport at all.
    #[must_use]
    pub fn with_realtime_enabled(mut self, enabled: bool) -> Self {
        self.realtime_enabled = enabled;
        self
    }

    /// Set the heartbeat timings.
    #[must_use]
    pub fn with_heartbeat(mut self, check_interval_ms: u64, stale_threshold_ms: u64) -> Self {
        self.heartbeat = HeartbeatConfig {
            check_interval_ms,
            stale_threshold_ms,
        };
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the channel layout.
    #[must_use]
    pub fn with_channels(mut self, channels: ChannelLayout) -> Self {
        self.channels = channels;
        self
    }

    /// Set the platform tag for activity entries.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg = ClientConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, ClientConfig::default());
        assert_eq!(cfg.heartbeat.check_interval(), Duration::from_secs(10));
        assert_eq!(cfg.heartbeat.stale_threshold(), Duration::from_secs(30));
        assert_eq!(cfg.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_partial_document_overrides() {
        let cfg = ClientConfig::from_json_str(
            r#"{"reconnect": {"max_attempts": 3}, "channels": {"database_id": "prod"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.reconnect.max_attempts, 3);
        assert_eq!(cfg.reconnect.base_delay_ms, 1_000);
        assert_eq!(cfg.channels.database_id, "prod");
        assert_eq!(cfg.channels.portfolio_collection, "portfolios");
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| u64::try_from(policy.delay_for_attempt(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    }

    #[test]
    fn test_backoff_cap() {
        let policy = ReconnectPolicy {
            max_delay_ms: Some(3_000),
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(3_000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = ClientConfig::default().with_heartbeat(0, 10);
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig::default().with_heartbeat(10_000, 5_000);
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig::default().with_reconnect(ReconnectPolicy {
            multiplier: 0.5,
            ..ReconnectPolicy::default()
        });
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::InvalidConfig { field, .. }) if field == "reconnect.multiplier"
        ));

        assert!(ClientConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_channel_layout_paths() {
        let layout = ChannelLayout::default();
        let entity = EntityId::new("user-42").unwrap();
        assert_eq!(
            layout.channel_path(StandardChannel::Transaction, &entity),
            "databases.main.collections.transactions.documents"
        );
        assert_eq!(
            layout.channel_path(StandardChannel::UserProfile, &entity),
            "databases.main.collections.users.documents.user-42"
        );
        assert_eq!(
            layout.classify("databases.main.collections.portfolios.documents", &entity),
            Some(StandardChannel::Portfolio)
        );
        assert_eq!(layout.classify("elsewhere", &entity), None);
    }
}
