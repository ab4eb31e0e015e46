//! Event system for the phone core
//!
//! Every state transition and every diagnostics record is published on a
//! broadcast channel. Front ends subscribe with [`EventEmitter::subscribe`] and
//! render what they need; the core itself never formats for display.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{CallId, CallState};
use crate::diagnostics::DiagnosticEvent;
use crate::registration::RegistrationState;
use crate::signaling::TransportState;

/// Events emitted by the phone core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhoneEvent {
    /// Registration state machine moved
    RegistrationStateChanged {
        previous: RegistrationState,
        current: RegistrationState,
        /// Response summary or failure reason
        reason: Option<String>,
    },

    /// The signaling transport reported a new state (observational only)
    TransportStateChanged { state: TransportState },

    /// Call state machine moved
    CallStateChanged {
        call_id: CallId,
        previous: CallState,
        current: CallState,
        reason: Option<String>,
    },

    /// Remote audio was routed to the playback sink
    RemoteMediaAttached { call_id: CallId, stream_id: String },

    /// The local capture stream was handed back to the provider
    LocalMediaReleased { stream_id: String },

    /// A connectivity diagnostics record
    Diagnostic(DiagnosticEvent),
}

/// Event stream type
pub type EventStream = BroadcastStream<PhoneEvent>;

/// Event emitter shared by the controllers and diagnostics
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<PhoneEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: PhoneEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events as a stream
    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Subscribe to events as a raw receiver
    pub fn receiver(&self) -> broadcast::Receiver<PhoneEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
