//! Signaling collaborator contracts
//!
//! The SIP user agent, its transport and the outbound INVITE session are
//! supplied from outside the core. These traits describe exactly what the
//! controllers need from them.
//!
//! # Layering
//!
//! ```text
//! WebPhone -> {RegistrationController, CallController}
//!          -> UserAgent -> OutboundSession -> PeerTransport
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{IceServerConfig, IceTransportPolicy};
use crate::error::SignalingError;
use crate::media::{LocalStream, RemoteStream};
use crate::sdp::SessionDescriptionModifier;
use crate::transport::PeerTransport;
use crate::uri::SipUri;

/// State of the signaling (WebSocket) transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "Connecting",
            Self::Connected => "Connected (unregistered)",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// A final or provisional SIP response as seen by the core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipResponse {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            reason_phrase: Some(reason_phrase.into()),
        }
    }

    /// `"<code> <reason>"`, trimmed; empty when both parts are absent
    pub fn summary(&self) -> String {
        let code = self.status_code.map(|c| c.to_string()).unwrap_or_default();
        let reason = self.reason_phrase.as_deref().unwrap_or("");
        format!("{code} {reason}").trim().to_string()
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.status_code, Some(100..=199))
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Result of a REGISTER transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted(SipResponse),
    Rejected(SipResponse),
}

/// Everything a user agent needs to be built
#[derive(Debug, Clone)]
pub struct UserAgentOptions {
    pub uri: SipUri,
    pub authorization_username: String,
    pub authorization_password: String,
    /// Normalized WebSocket server URL
    pub server: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Builds user agents; one per registration attempt
pub trait UserAgentFactory: Send + Sync {
    fn create(&self, options: UserAgentOptions) -> Arc<dyn UserAgent>;
}

/// A SIP user agent bound to one identity and one signaling transport
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Open the signaling transport
    async fn start(&self) -> Result<(), SignalingError>;

    /// Close the signaling transport
    async fn stop(&self) -> Result<(), SignalingError>;

    /// Send REGISTER and wait for the final response
    async fn register(&self) -> Result<RegisterOutcome, SignalingError>;

    async fn unregister(&self) -> Result<(), SignalingError>;

    /// Subscribe to transport state changes
    fn transport_events(&self) -> broadcast::Receiver<TransportState>;

    /// Prepare an outbound INVITE session without sending it
    fn create_inviter(
        &self,
        target: &SipUri,
        options: InviteOptions,
    ) -> Result<Arc<dyn OutboundSession>, SignalingError>;
}

/// Options of an outbound INVITE
#[derive(Clone, Default)]
pub struct InviteOptions {
    /// Applied to every local offer and answer
    pub modifiers: Vec<Arc<dyn SessionDescriptionModifier>>,
    pub local_stream: Option<LocalStream>,
    pub audio: bool,
    pub video: bool,
}

impl fmt::Debug for InviteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteOptions")
            .field("modifiers", &self.modifiers.len())
            .field("local_stream", &self.local_stream)
            .field("audio", &self.audio)
            .field("video", &self.video)
            .finish()
    }
}

/// Lifecycle of an INVITE dialog as reported by the session library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

/// Events delivered by an outbound session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Provisional response (1xx)
    Progress(SipResponse),
    /// 2xx to the INVITE
    Accepted(SipResponse),
    /// Final non-2xx to the INVITE
    Rejected(SipResponse),
    StateChanged(SessionState),
}

/// One outbound call leg
#[async_trait]
pub trait OutboundSession: Send + Sync {
    /// Send the INVITE; returns once it is on the wire
    async fn invite(&self) -> Result<(), SignalingError>;

    /// Cancel a pending INVITE
    async fn cancel(&self) -> Result<(), SignalingError>;

    /// End an established dialog
    async fn bye(&self) -> Result<(), SignalingError>;

    fn state(&self) -> SessionState;

    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Media transport, once the negotiation handler exists
    fn peer_transport(&self) -> Option<Arc<dyn PeerTransport>>;

    /// First remote stream with an audio track, if any has arrived
    fn remote_stream(&self) -> Option<RemoteStream>;
}
