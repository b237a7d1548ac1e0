//! Entity identifiers.
//!
//! An entity (usually a user) is what the standard subscription set is bound
//! to. Inbound payloads that name a different owner are dropped before they
//! reach any callback.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifier of the entity the client is bound to.
///
/// Guaranteed non-empty after construction.
///
/// # Examples
///
/// ```
/// use realtime_sync::EntityId;
///
/// let id = EntityId::new("user-42").unwrap();
/// assert_eq!(id.as_str(), "user-42");
/// assert!(EntityId::new("   ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyEntityId`] if the trimmed input is empty.
    pub fn new(id: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = id.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl PartialEq<str> for EntityId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_trims() {
        let id = EntityId::new("  user-1 ").unwrap();
        assert_eq!(id.as_str(), "user-1");
        assert_eq!(id.to_string(), "user-1");
    }

    #[test]
    fn test_entity_id_rejects_empty() {
        assert_eq!(EntityId::new(""), Err(ValidationError::EmptyEntityId));
        assert_eq!(EntityId::new("\t"), Err(ValidationError::EmptyEntityId));
    }

    #[test]
    fn test_entity_id_serde_validates() {
        let id: EntityId = serde_json::from_str("\"user-7\"").unwrap();
        assert_eq!(id.as_str(), "user-7");
        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user-7\"");
    }
}
