//! Negotiation transport (peer connection) collaborator
//!
//! A [`PeerTransport`] is the media transport a negotiation session creates.
//! The core only observes it: connectivity events arrive on a broadcast
//! channel and statistics are pulled on demand.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::diagnostics::stats::StatsSnapshot;
use crate::error::StatsError;
use crate::media::RemoteStream;

/// Identity of one transport, used as the key of per-transport side tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportId(pub Uuid);

impl TransportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ICE connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// A usable path has been found
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// Media can no longer flow on this path
    pub fn is_down(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Overall peer-connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn is_down(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events raised by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A remote track arrived; `stream` is absent when the track has no stream
    TrackArrived {
        kind: String,
        stream: Option<RemoteStream>,
    },
    /// A local ICE candidate was gathered (raw `candidate:` line)
    CandidateGenerated { candidate: String },
    /// Candidate gathering finished
    CandidateGatheringComplete,
    /// A STUN/TURN server returned an error while gathering
    CandidateError { code: u16, text: String },
    /// ICE connectivity changed
    IceConnectionStateChanged(IceConnectionState),
    /// Overall connection state changed
    ConnectionStateChanged(PeerConnectionState),
}

/// The media transport of one negotiation session
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Stable identity of this transport
    fn id(&self) -> TransportId;

    /// Subscribe to transport events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Take a statistics snapshot
    async fn stats(&self) -> Result<StatsSnapshot, StatsError>;

    /// Current overall connection state
    fn connection_state(&self) -> PeerConnectionState;
}
