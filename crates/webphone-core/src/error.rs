//! Error types for the phone core
//!
//! Validation failures are returned synchronously before any collaborator is
//! touched. Network and negotiation failures are returned as well, but are also
//! recorded as a state transition carrying a human-readable reason. Diagnostics
//! failures never reach this type as a returned error; they only surface as
//! [`crate::diagnostics::DiagnosticEvent::QueryFailed`] records.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for phone operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Errors that can occur while registering or placing a call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneError {
    /// Identity, domain or secret was empty
    #[error("Missing ext/domain/password")]
    MissingCredentials,

    /// The identity and domain do not form a valid SIP URI
    #[error("Invalid SIP URI: {reason}")]
    InvalidIdentity { reason: String },

    /// The dialled destination does not form a valid SIP URI
    #[error("Invalid destination: {reason}")]
    InvalidDestination { reason: String },

    /// No destination was supplied
    #[error("Missing destination")]
    MissingDestination,

    /// A call was requested while not registered
    #[error("Not registered")]
    NotRegistered,

    /// A call was requested while another call is live
    #[error("Call already active")]
    CallAlreadyActive,

    /// Microphone capture was refused or unavailable
    #[error("Microphone permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// The signaling transport could not be started
    #[error("UA start failed: {reason}")]
    TransportStartFailed { reason: String },

    /// The registrar rejected the registration
    #[error("Register failed: {reason}")]
    RegisterRejected { reason: String },

    /// The INVITE could not be created or sent
    #[error("Call failed (invite error): {reason}")]
    InviteFailed { reason: String },

    /// A statistics query failed (reported, never fatal)
    #[error("Diagnostics query failed: {reason}")]
    DiagnosticsQueryFailed { reason: String },

    /// The phone was assembled without a required collaborator
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Any other failure reported by the signaling library
    #[error("Signaling error: {message}")]
    Signaling { message: String },
}

/// Error categories for event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Rejected before any resource was acquired
    Validation,
    /// Microphone or playback problem
    Media,
    /// Transport, registrar or call signaling problem
    Network,
    /// Diagnostics only, never user-facing
    Diagnostics,
    /// Builder or configuration misuse
    Configuration,
}

impl PhoneError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a signaling error
    pub fn signaling(message: impl Into<String>) -> Self {
        Self::Signaling {
            message: message.into(),
        }
    }

    /// Create an invite failure
    pub fn invite_failed(reason: impl Into<String>) -> Self {
        Self::InviteFailed {
            reason: reason.into(),
        }
    }

    /// True for errors reported before any resource is acquired
    pub fn is_validation(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Get the category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingCredentials
            | Self::InvalidIdentity { .. }
            | Self::InvalidDestination { .. }
            | Self::MissingDestination
            | Self::NotRegistered
            | Self::CallAlreadyActive => ErrorCategory::Validation,
            Self::PermissionDenied { .. } => ErrorCategory::Media,
            Self::TransportStartFailed { .. }
            | Self::RegisterRejected { .. }
            | Self::InviteFailed { .. }
            | Self::Signaling { .. } => ErrorCategory::Network,
            Self::DiagnosticsQueryFailed { .. } => ErrorCategory::Diagnostics,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }
}

/// Failure reported by the signaling library
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// The WebSocket transport could not connect
    #[error("transport error: {0}")]
    Transport(String),

    /// A request could not be sent in the current dialog state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Anything else the library raised
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the media-capture provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused microphone access
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No capture API is available on this platform
    #[error("capture unavailable: {0}")]
    Unavailable(String),
}

impl From<MediaError> for PhoneError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(reason) | MediaError::Unavailable(reason) => {
                PhoneError::PermissionDenied { reason }
            }
        }
    }
}

/// Failure of a transport statistics query
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatsError {
    /// The transport was closed before the snapshot was taken
    #[error("transport closed")]
    Closed,

    /// The provider failed to produce a snapshot
    #[error("stats query failed: {0}")]
    Query(String),
}

impl From<StatsError> for PhoneError {
    fn from(err: StatsError) -> Self {
        PhoneError::DiagnosticsQueryFailed {
            reason: err.to_string(),
        }
    }
}
