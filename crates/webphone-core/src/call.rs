//! Outbound call lifecycle
//!
//! ```text
//! Idle -> Dialing -> (Ringing) -> Established -> Terminated -> Idle
//! Dialing | Ringing -> Terminated   (reject, cancel, invite error)
//! ```
//!
//! Session callbacks and transport track arrivals are funnelled into
//! [`CallController::dispatch`]. Whichever path ends the call, the capture
//! stream is released and the call slot cleared exactly once: both happen
//! when the [`ActiveCall`] is taken out of the context, and only one caller
//! can take it.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::AppSessionContext;
use crate::error::{PhoneError, PhoneResult};
use crate::events::PhoneEvent;
use crate::media::{LocalStream, RemoteStream};
use crate::sdp::CodecFilter;
use crate::signaling::{InviteOptions, OutboundSession, SessionEvent, SessionState};
use crate::transport::{TransportEvent, TransportId};
use crate::uri::SipUri;

/// Unique identifier for a call
pub type CallId = Uuid;

/// Current state of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    /// INVITE sent, no provisional answer yet
    Dialing,
    /// 180/183 received
    Ringing,
    Established,
    Terminated,
}

/// Named call transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Dial,
    Ring,
    Answer,
    Terminate,
    Clear,
}

impl CallState {
    pub fn next(self, transition: CallTransition) -> Option<Self> {
        use CallState::*;
        use CallTransition as T;

        match (self, transition) {
            (Idle, T::Dial) => Some(Dialing),
            (Dialing, T::Ring) => Some(Ringing),
            (Dialing | Ringing, T::Answer) => Some(Established),
            (Dialing | Ringing | Established, T::Terminate) => Some(Terminated),
            (Terminated, T::Clear) => Some(Idle),
            _ => None,
        }
    }

    /// Check if the call is still in progress
    pub fn is_active(self) -> bool {
        matches!(self, Self::Dialing | Self::Ringing | Self::Established)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Dialing => "Dialing",
            Self::Ringing => "Ringing",
            Self::Established => "Established",
            Self::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    /// Local hangup
    Hangup,
    /// Final non-2xx response, with its summary
    Rejected(String),
    /// The INVITE could not be sent
    InviteError(String),
    /// The session terminated on its own (remote BYE, transport loss)
    SessionTerminated,
}

impl EndReason {
    fn status(&self) -> String {
        match self {
            Self::Rejected(summary) if !summary.is_empty() => format!("Call failed ({summary})"),
            Self::Rejected(_) => "Call failed".to_string(),
            Self::InviteError(_) => "Call failed (invite error)".to_string(),
            Self::Hangup | Self::SessionTerminated => "Idle".to_string(),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hangup => f.write_str("hangup"),
            Self::Rejected(summary) => write!(f, "rejected {summary}"),
            Self::InviteError(reason) => write!(f, "invite error: {reason}"),
            Self::SessionTerminated => f.write_str("session terminated"),
        }
    }
}

/// Information about a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    /// Target URI
    pub destination: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallInfo {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            destination: destination.into(),
            state: CallState::Idle,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.connected_at?)
    }
}

/// The one live call
pub(crate) struct ActiveCall {
    pub info: CallInfo,
    pub session: Arc<dyn OutboundSession>,
    pub local_stream: Option<LocalStream>,
    pub transport: Option<TransportId>,
    pub attached_stream: Option<String>,
    pub session_pump: Option<JoinHandle<()>>,
    pub track_pump: Option<JoinHandle<()>>,
}

impl ActiveCall {
    pub fn abort_tasks(&mut self) {
        for task in [self.session_pump.take(), self.track_pump.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// Inputs of the call state machine
#[derive(Debug, Clone)]
pub enum CallSignal {
    Session(SessionEvent),
    TrackArrived(Option<RemoteStream>),
}

/// Places and tears down the single outbound call
#[derive(Clone)]
pub struct CallController {
    ctx: Arc<AppSessionContext>,
}

impl CallController {
    pub fn new(ctx: Arc<AppSessionContext>) -> Self {
        Self { ctx }
    }

    /// State of the active call, `Idle` when there is none
    pub fn state(&self) -> CallState {
        self.ctx.with_slots(|s| {
            s.call
                .as_ref()
                .map(|c| c.info.state)
                .unwrap_or(CallState::Idle)
        })
    }

    pub fn active_call(&self) -> Option<CallInfo> {
        self.ctx.with_slots(|s| s.call.as_ref().map(|c| c.info.clone()))
    }

    pub fn last_call(&self) -> Option<CallInfo> {
        self.ctx.last_call()
    }

    pub fn has_active_call(&self) -> bool {
        self.ctx.with_slots(|s| s.call.is_some())
    }

    /// Place a call to `destination` (user part, resolved against the
    /// registered domain)
    ///
    /// Returns once the INVITE is on the wire. Progress, answer and failure
    /// arrive later as [`PhoneEvent::CallStateChanged`].
    pub async fn place(&self, destination: &str) -> PhoneResult<CallId> {
        let destination = destination.trim();
        let (user_agent, generation, domain) = self.ctx.with_slots(|s| {
            if !s.registration_state.is_registered() {
                return Err(PhoneError::NotRegistered);
            }
            if s.call.is_some() {
                return Err(PhoneError::CallAlreadyActive);
            }
            if destination.is_empty() {
                return Err(PhoneError::MissingDestination);
            }
            let user_agent = s.user_agent.clone().ok_or(PhoneError::NotRegistered)?;
            Ok((user_agent, s.generation, s.domain.clone()))
        })?;

        let stream = self.ctx.capture.acquire().await.map_err(|e| {
            warn!(error = %e, "microphone permission denied");
            PhoneError::from(e)
        })?;
        info!(stream = %stream, "microphone permission granted");

        let target = match SipUri::new(destination, &domain) {
            Ok(target) => target,
            Err(e) => {
                self.ctx.release_stream(stream);
                return Err(PhoneError::InvalidDestination {
                    reason: e.to_string(),
                });
            }
        };

        let options = InviteOptions {
            modifiers: vec![Arc::new(CodecFilter::from_config(self.ctx.config()))],
            local_stream: Some(stream.clone()),
            audio: true,
            video: false,
        };
        let session = match user_agent.create_inviter(&target, options) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to create inviter");
                self.ctx.release_stream(stream);
                return Err(PhoneError::invite_failed(e.to_string()));
            }
        };

        let info = CallInfo::new(target.to_string());
        let call_id = info.call_id;
        let session_events = session.events();

        // The registration or another call may have moved while waiting for
        // the microphone; check and claim the slot under one lock
        let claimed = self.ctx.with_slots(|s| {
            if s.generation != generation || !s.registration_state.is_registered() {
                return Err((PhoneError::NotRegistered, stream));
            }
            if s.call.is_some() {
                return Err((PhoneError::CallAlreadyActive, stream));
            }
            s.call = Some(ActiveCall {
                info,
                session: session.clone(),
                local_stream: Some(stream),
                transport: None,
                attached_stream: None,
                session_pump: None,
                track_pump: None,
            });
            Ok(())
        });
        if let Err((e, stream)) = claimed {
            debug!(error = %e, "dropping uninvited session");
            self.ctx.release_stream(stream);
            return Err(e);
        }

        info!(%call_id, target = %target, "dialing");
        self.bind_transport(call_id, &session);
        self.transition(call_id, CallTransition::Dial, None);
        self.ctx.set_status("Calling...");

        let pump = tokio::spawn(pump_session(
            Arc::downgrade(&self.ctx),
            call_id,
            session_events,
        ));
        self.ctx.with_slots(|s| match s.call.as_mut() {
            Some(call) if call.info.call_id == call_id => call.session_pump = Some(pump),
            _ => pump.abort(),
        });

        match session.invite().await {
            Ok(()) => {
                info!(%call_id, "invite sent");
                Ok(call_id)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(%call_id, error = %reason, "invite failed");
                self.terminate(call_id, EndReason::InviteError(reason.clone()));
                Err(PhoneError::InviteFailed { reason })
            }
        }
    }

    /// End the active call; a no-op when there is none
    ///
    /// Sends BYE on an established dialog and CANCEL otherwise. Either
    /// failing is logged and ignored; the call is always torn down.
    pub async fn hangup(&self) {
        let Some((call_id, session)) = self
            .ctx
            .with_slots(|s| s.call.as_ref().map(|c| (c.info.call_id, c.session.clone())))
        else {
            return;
        };

        info!(%call_id, "hangup");
        let result = if session.state() == SessionState::Established {
            session.bye().await
        } else {
            session.cancel().await
        };
        if let Err(e) = result {
            debug!(%call_id, error = %e, "bye/cancel failed, ignoring");
        }

        self.terminate(call_id, EndReason::Hangup);
    }

    /// Single entry point for everything that happens to a live call
    pub fn dispatch(&self, call_id: CallId, signal: CallSignal) {
        let Some(session) = self.ctx.with_slots(|s| match s.call.as_ref() {
            Some(call) if call.info.call_id == call_id => Some(call.session.clone()),
            _ => None,
        }) else {
            debug!(%call_id, ?signal, "signal for a call that is gone");
            return;
        };

        match signal {
            CallSignal::Session(SessionEvent::Progress(response)) => {
                info!(%call_id, response = %response, "progress");
                if matches!(response.status_code, Some(180 | 183)) {
                    self.transition(call_id, CallTransition::Ring, None);
                    self.ctx.set_status("Ringing");
                }
            }
            CallSignal::Session(SessionEvent::Accepted(response)) => {
                info!(%call_id, response = %response, "accepted");
                self.establish(call_id, &session);
            }
            CallSignal::Session(SessionEvent::Rejected(response)) => {
                info!(%call_id, response = %response, "INVITE rejected");
                self.terminate(call_id, EndReason::Rejected(response.summary()));
            }
            CallSignal::Session(SessionEvent::StateChanged(state)) => {
                debug!(%call_id, ?state, "session state");
                self.bind_transport(call_id, &session);
                match state {
                    SessionState::Established => self.establish(call_id, &session),
                    SessionState::Terminated => {
                        self.terminate(call_id, EndReason::SessionTerminated)
                    }
                    _ => {}
                }
            }
            CallSignal::TrackArrived(Some(stream)) => {
                info!(%call_id, stream = %stream, "remote track received");
                self.attach_remote(call_id, &stream);
            }
            CallSignal::TrackArrived(None) => {
                debug!(%call_id, "track arrived without a stream");
            }
        }
    }

    fn establish(&self, call_id: CallId, session: &Arc<dyn OutboundSession>) {
        if self.transition(call_id, CallTransition::Answer, None) {
            self.ctx.with_slots(|s| {
                if let Some(call) = s.call.as_mut() {
                    call.info.connected_at = Some(Utc::now());
                }
            });
            self.ctx.set_status("Call established");
        }
        match session.remote_stream() {
            Some(stream) => {
                self.attach_remote(call_id, &stream);
            }
            None => debug!(%call_id, "no remote stream yet"),
        }
    }

    /// Route a remote stream to playback; repeated streams are ignored
    fn attach_remote(&self, call_id: CallId, stream: &RemoteStream) -> bool {
        let fresh = self.ctx.with_slots(|s| match s.call.as_mut() {
            Some(call) if call.info.call_id == call_id => {
                if call.attached_stream.as_deref() == Some(stream.id()) {
                    false
                } else {
                    call.attached_stream = Some(stream.id().to_string());
                    true
                }
            }
            _ => false,
        });
        if !fresh {
            return false;
        }

        self.ctx.playback.attach(stream);
        info!(%call_id, stream = %stream, "remote audio attached");
        self.ctx.emit(PhoneEvent::RemoteMediaAttached {
            call_id,
            stream_id: stream.id().to_string(),
        });
        true
    }

    /// Bind diagnostics and the track watcher once the transport exists
    fn bind_transport(&self, call_id: CallId, session: &Arc<dyn OutboundSession>) {
        let Some(transport) = session.peer_transport() else {
            return;
        };
        let id = transport.id();
        let claimed = self.ctx.with_slots(|s| match s.call.as_mut() {
            Some(call) if call.info.call_id == call_id && call.transport.is_none() => {
                call.transport = Some(id);
                true
            }
            _ => false,
        });
        if !claimed {
            return;
        }

        self.ctx.diagnostics.bind(transport.clone(), "outbound");
        let pump = tokio::spawn(pump_tracks(
            Arc::downgrade(&self.ctx),
            call_id,
            transport.events(),
        ));
        self.ctx.with_slots(|s| match s.call.as_mut() {
            Some(call) if call.info.call_id == call_id => call.track_pump = Some(pump),
            _ => pump.abort(),
        });
    }

    fn transition(
        &self,
        call_id: CallId,
        transition: CallTransition,
        reason: Option<String>,
    ) -> bool {
        let moved = self.ctx.with_slots(|s| {
            let call = s.call.as_mut().filter(|c| c.info.call_id == call_id)?;
            let previous = call.info.state;
            let current = previous.next(transition)?;
            call.info.state = current;
            Some((previous, current))
        });
        let Some((previous, current)) = moved else {
            return false;
        };
        info!(%call_id, %previous, %current, "call state");
        self.ctx.emit(PhoneEvent::CallStateChanged {
            call_id,
            previous,
            current,
            reason,
        });
        true
    }

    /// Tear the call down: the only place media is released and the slot cleared
    fn terminate(&self, call_id: CallId, reason: EndReason) {
        let Some(mut call) = self.ctx.with_slots(|s| {
            if s.call.as_ref().is_some_and(|c| c.info.call_id == call_id) {
                s.call.take()
            } else {
                None
            }
        }) else {
            return;
        };

        call.abort_tasks();
        if let Some(transport) = call.transport.take() {
            self.ctx.diagnostics.unbind(transport);
        }
        if let Some(stream) = call.local_stream.take() {
            self.ctx.release_stream(stream);
        }

        let previous = call.info.state;
        call.info.state = CallState::Terminated;
        call.info.ended_at = Some(Utc::now());
        call.info.end_reason = Some(reason.clone());
        info!(%call_id, reason = %reason, "call terminated");

        self.ctx.emit(PhoneEvent::CallStateChanged {
            call_id,
            previous,
            current: CallState::Terminated,
            reason: Some(reason.to_string()),
        });
        self.ctx.emit(PhoneEvent::CallStateChanged {
            call_id,
            previous: CallState::Terminated,
            current: CallState::Idle,
            reason: None,
        });
        self.ctx.set_status(reason.status());
        self.ctx.with_slots(|s| s.last_call = Some(call.info));
    }
}

async fn pump_session(
    ctx: Weak<AppSessionContext>,
    call_id: CallId,
    mut rx: broadcast::Receiver<SessionEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%call_id, skipped, "session events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(ctx) = ctx.upgrade() else { break };
        CallController::new(ctx).dispatch(call_id, CallSignal::Session(event));
    }
}

async fn pump_tracks(
    ctx: Weak<AppSessionContext>,
    call_id: CallId,
    mut rx: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let stream = match rx.recv().await {
            Ok(TransportEvent::TrackArrived { kind, stream }) if kind == "audio" => stream,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(ctx) = ctx.upgrade() else { break };
        CallController::new(ctx).dispatch(call_id, CallSignal::TrackArrived(stream));
    }
}
