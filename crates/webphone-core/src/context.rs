//! Shared session context
//!
//! One [`AppSessionContext`] backs one phone instance. It owns the
//! collaborators and the mutable session state (current user agent,
//! registration, active call). Both controllers hold an `Arc` of it.
//!
//! The state mutex is only ever taken for short synchronous sections and is
//! never held across an `.await`. Every async step re-checks the state it
//! depends on after resuming, using the registration generation or the call
//! id, and drops its result when that state has moved on.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::call::{ActiveCall, CallInfo};
use crate::config::PhoneConfig;
use crate::diagnostics::ConnectivityDiagnostics;
use crate::events::{EventEmitter, PhoneEvent};
use crate::media::{LocalStream, MediaCapture, PlaybackSink};
use crate::registration::{RegistrationInfo, RegistrationState};
use crate::signaling::{TransportState, UserAgent, UserAgentFactory};

/// Mutable state of one phone instance
pub(crate) struct SessionSlots {
    pub registration_state: RegistrationState,
    pub registration: Option<RegistrationInfo>,
    pub user_agent: Option<Arc<dyn UserAgent>>,
    pub transport_watcher: Option<JoinHandle<()>>,
    pub transport_state: Option<TransportState>,
    /// Bumped on every start and stop; async steps compare against it
    pub generation: u64,
    /// Domain of the live registration, used to build call targets
    pub domain: String,
    pub call: Option<ActiveCall>,
    pub last_call: Option<CallInfo>,
    /// Human-readable status line
    pub status: String,
}

impl Default for SessionSlots {
    fn default() -> Self {
        Self {
            registration_state: RegistrationState::Idle,
            registration: None,
            user_agent: None,
            transport_watcher: None,
            transport_state: None,
            generation: 0,
            domain: String::new(),
            call: None,
            last_call: None,
            status: "Idle".to_string(),
        }
    }
}

/// Collaborators plus the session state they act on
pub struct AppSessionContext {
    pub(crate) config: PhoneConfig,
    pub(crate) events: EventEmitter,
    pub(crate) diagnostics: ConnectivityDiagnostics,
    pub(crate) factory: Arc<dyn UserAgentFactory>,
    pub(crate) capture: Arc<dyn MediaCapture>,
    pub(crate) playback: Arc<dyn PlaybackSink>,
    slots: Mutex<SessionSlots>,
}

impl AppSessionContext {
    pub fn new(
        config: PhoneConfig,
        factory: Arc<dyn UserAgentFactory>,
        capture: Arc<dyn MediaCapture>,
        playback: Arc<dyn PlaybackSink>,
    ) -> Arc<Self> {
        let events = EventEmitter::new(config.event_capacity);
        let diagnostics = ConnectivityDiagnostics::new(&config, events.clone());
        Arc::new(Self {
            config,
            events,
            diagnostics,
            factory,
            capture,
            playback,
            slots: Mutex::new(SessionSlots::default()),
        })
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn diagnostics(&self) -> &ConnectivityDiagnostics {
        &self.diagnostics
    }

    /// Run `f` with the session state locked
    pub(crate) fn with_slots<R>(&self, f: impl FnOnce(&mut SessionSlots) -> R) -> R {
        let mut slots = self.slots.lock();
        f(&mut slots)
    }

    pub(crate) fn emit(&self, event: PhoneEvent) {
        self.events.emit(event);
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        debug!(status = %status, "status");
        self.with_slots(|s| s.status = status);
    }

    pub fn status(&self) -> String {
        self.with_slots(|s| s.status.clone())
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.with_slots(|s| s.registration_state)
    }

    pub fn registration_info(&self) -> Option<RegistrationInfo> {
        self.with_slots(|s| s.registration.clone())
    }

    pub fn transport_state(&self) -> Option<TransportState> {
        self.with_slots(|s| s.transport_state)
    }

    pub fn last_call(&self) -> Option<CallInfo> {
        self.with_slots(|s| s.last_call.clone())
    }

    /// Hand a capture stream back to the provider
    pub(crate) fn release_stream(&self, stream: LocalStream) {
        let stream_id = stream.id().to_string();
        self.capture.release(stream);
        info!(stream = %stream_id, "microphone stream stopped");
        self.emit(PhoneEvent::LocalMediaReleased { stream_id });
    }

    /// Drop every piece of session state; used by shutdown after a full stop
    pub(crate) fn reset(&self) {
        let leftover = self.with_slots(|s| {
            if let Some(watcher) = s.transport_watcher.take() {
                watcher.abort();
            }
            let generation = s.generation + 1;
            let call = s.call.take();
            *s = SessionSlots {
                generation,
                ..SessionSlots::default()
            };
            call
        });
        if let Some(mut call) = leftover {
            call.abort_tasks();
            if let Some(stream) = call.local_stream.take() {
                self.release_stream(stream);
            }
        }
    }
}
