//! Channel sets and the standard per-entity channels.
//!
//! A channel set is the ordered group of transport-level topic identifiers a
//! single logical subscription listens on. Two subscriptions with the same
//! ordered channels share one [`ChannelKey`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Separator used when joining a channel set into its key.
const KEY_SEPARATOR: &str = ",";

/// Ordered, non-empty sequence of channel identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChannelSet(Vec<String>);

impl ChannelSet {
    /// Builds a channel set.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyChannelSet`] when no channels are given and
    /// [`ValidationError::EmptyChannel`] when any identifier is blank.
    pub fn new<I, S>(channels: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            return Err(ValidationError::EmptyChannelSet);
        }
        if let Some(index) = channels.iter().position(|c| c.trim().is_empty()) {
            return Err(ValidationError::EmptyChannel { index });
        }
        Ok(Self(channels))
    }

    /// Single-channel convenience constructor.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyChannel`] if `channel` is blank.
    pub fn single(channel: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new([channel.into()])
    }

    /// The joined key identifying this set in the registry.
    #[must_use]
    pub fn key(&self) -> ChannelKey {
        ChannelKey(self.0.join(KEY_SEPARATOR))
    }

    /// Channel identifiers in subscription order.
    #[must_use]
    pub fn channels(&self) -> &[String] {
        &self.0
    }

    /// Returns true if `channel` is one of this set's identifiers.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.0.iter().any(|c| c == channel)
    }

    /// Returns true if any of `channels` is in this set.
    #[must_use]
    pub fn intersects<'a, I>(&self, channels: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        channels.into_iter().any(|c| self.contains(c))
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().0)
    }
}

impl TryFrom<Vec<String>> for ChannelSet {
    type Error = ValidationError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelSet> for Vec<String> {
    fn from(set: ChannelSet) -> Self {
        set.0
    }
}

/// Registry key for a channel set (its channels joined by `,`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// The joined key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The standard per-entity data categories established by `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StandardChannel {
    /// Portfolio document changes.
    Portfolio,
    /// Transaction document changes.
    Transaction,
    /// Activity feed document changes.
    Activity,
    /// The bound entity's own profile document.
    UserProfile,
}

impl StandardChannel {
    /// All standard channels, in establishment order.
    pub const ALL: [Self; 4] = [
        Self::Portfolio,
        Self::Transaction,
        Self::Activity,
        Self::UserProfile,
    ];

    /// Name of the application callback that receives this category.
    #[must_use]
    pub const fn callback_name(self) -> &'static str {
        match self {
            Self::Portfolio => "onPortfolioUpdate",
            Self::Transaction => "onTransactionUpdate",
            Self::Activity => "onActivityUpdate",
            Self::UserProfile => "onUserUpdate",
        }
    }
}

impl fmt::Display for StandardChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Portfolio => "portfolio",
            Self::Transaction => "transaction",
            Self::Activity => "activity",
            Self::UserProfile => "user_profile",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_joins_in_order() {
        let set = ChannelSet::new(["a", "b", "c"]).unwrap();
        assert_eq!(set.key().as_str(), "a,b,c");

        let reordered = ChannelSet::new(["c", "b", "a"]).unwrap();
        assert_ne!(set.key(), reordered.key());
    }

    #[test]
    fn test_rejects_empty_sets_and_channels() {
        assert_eq!(
            ChannelSet::new(Vec::<String>::new()),
            Err(ValidationError::EmptyChannelSet)
        );
        assert_eq!(
            ChannelSet::new(["ok", " "]),
            Err(ValidationError::EmptyChannel { index: 1 })
        );
    }

    #[test]
    fn test_contains_and_intersects() {
        let set = ChannelSet::new(["x", "y"]).unwrap();
        assert!(set.contains("y"));
        assert!(!set.contains("z"));
        assert!(set.intersects(["z", "x"]));
        assert!(!set.intersects(["z"]));
    }

    #[test]
    fn test_serde_roundtrip_validates() {
        let set: ChannelSet = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(set.channels(), ["a", "b"]);
        assert!(serde_json::from_str::<ChannelSet>("[]").is_err());
    }

    #[test]
    fn test_standard_callback_names() {
        assert_eq!(StandardChannel::Transaction.callback_name(), "onTransactionUpdate");
        assert_eq!(StandardChannel::ALL.len(), 4);
        assert_eq!(StandardChannel::UserProfile.to_string(), "user_profile");
    }
}
