//! Error types for the real-time synchronization client.
//!
//! All errors are strongly typed using thiserror. Most failures originate
//! inside timer-driven or dispatch code paths, so besides being returned from
//! the public async operations they are also published on the client's
//! `error` event channel (see [`crate::events::ClientEvent::Error`]).

use thiserror::Error;

use crate::channel::ChannelSet;

/// Validation errors that occur during input validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Entity identifier cannot be empty")]
    EmptyEntityId,

    #[error("Channel set cannot be empty")]
    EmptyChannelSet,

    #[error("Channel identifier at position {index} is empty")]
    EmptyChannel {
        index: usize,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

/// Errors reported by the external real-time transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Transport is not open")]
    NotOpen,

    #[error("Subscribe rejected for [{channels}]: {message}")]
    SubscribeRejected {
        channels: String,
        message: String,
    },

    #[error("Unsubscribe failed: {message}")]
    UnsubscribeFailed {
        message: String,
    },

    #[error("Failed to decode inbound message: {message}")]
    DecodeFailed {
        message: String,
    },
}

/// Failure returned (or raised) by an application callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallbackError {
    /// Human-readable description of what went wrong.
    pub message: String,
}

impl CallbackError {
    /// Creates a callback error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Discriminant of [`SyncError`], for matching on the failure category only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The underlying transport could not be opened.
    TransportOpenFailure,
    /// A channel-set registration failed.
    SubscriptionFailure,
    /// An application callback failed.
    CallbackFailure,
    /// Automatic recovery gave up.
    ReconnectExhausted,
    /// Invalid input.
    Validation,
    /// Any other transport-level failure.
    Transport,
    /// Internal invariant violation.
    Internal,
}

/// Top-level error type for the real-time client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Failed to open transport: {0}")]
    TransportOpen(#[source] TransportError),

    #[error("Subscription to [{channels}] failed: {source}")]
    Subscription {
        channels: ChannelSet,
        #[source]
        source: TransportError,
    },

    #[error("Callback '{callback}' failed: {source}")]
    Callback {
        callback: String,
        #[source]
        source: CallbackError,
    },

    #[error("Max reconnection attempts reached ({attempts})")]
    ReconnectExhausted {
        attempts: u32,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SyncError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the failure category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportOpen(_) => ErrorKind::TransportOpenFailure,
            Self::Subscription { .. } => ErrorKind::SubscriptionFailure,
            Self::Callback { .. } => ErrorKind::CallbackFailure,
            Self::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if the automatic recovery path applies to this error.
    ///
    /// Only connection loss is retried. Subscription and callback failures are
    /// reported once and need caller action.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::TransportOpen(_) => true,
            Self::Transport(e) => matches!(e, TransportError::ConnectionFailed { .. }),
            Self::Subscription { .. }
            | Self::Callback { .. }
            | Self::ReconnectExhausted { .. }
            | Self::Validation(_)
            | Self::Internal { .. } => false,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result type alias for client operations.
pub type SyncResult<T> = Result<T, SyncError>;
